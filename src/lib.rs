//! Resumable media upload engine.
//!
//! This crate moves media files deposited by an external relay process into
//! the backend media service over an unreliable network. Transfers are
//! chunked, offset-addressed and resumable mid-session; a bounded recovery
//! loop survives full session loss. The conversational surface (commands,
//! menus, payments, webhooks) lives in the consuming application and talks
//! to this crate through [`upload::Uploader`], [`flow::FlowRegistry`] and
//! [`dedupe::MediaGroupCache`].

pub mod config;
pub mod dedupe;
pub mod flow;
pub mod upload;
