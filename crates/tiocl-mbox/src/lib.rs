//! Mailboxes between the host runtime and each compute core.
//!
//! A [`Mailbox`] is a pair of single-producer/single-consumer rings: host → core carries
//! [`HostMessage`]s, core → host carries [`CoreMessage`]s. Payloads use the little-endian framing
//! in [`protocol`].
#![forbid(unsafe_code)]

pub mod layout;
mod mailbox;
pub mod ndrange;
pub mod protocol;
pub mod ring;

pub use mailbox::{Mailbox, MailboxError};
pub use ndrange::NdRange;
pub use protocol::{CoreMessage, DecodeError, HostMessage, KernelArg, KernelLaunch};
