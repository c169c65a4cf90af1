//! The quadplay development server: a security-scoped view of the engine,
//! the active game, and the user's game library, plus the small command
//! surface the IDE uses to edit, create, update, and export games.

pub mod allowlist;
pub mod commands;
pub mod endpoints;
pub mod error;
pub mod git;
pub mod host;
pub mod http;
pub mod install;
pub mod server;
pub mod token;
pub mod update;

pub use allowlist::{Allowlist, Root, RootKind};
pub use error::{ServeError, ServeResult};
pub use host::{HostEnvironment, KeyWatcher, NativeHost, Platform};
pub use install::{InstalledVersion, Provenance};
pub use server::{ServerConfig, ServerHandle, ServerState};
pub use token::SessionToken;
pub use update::{InstallUpdater, UpdateJob, UpdateSlot, UpdateStatus};
