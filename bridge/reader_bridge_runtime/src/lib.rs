//! Native side of an embedded web reading engine.
//!
//! A [`ReaderSession`] serves book bytes to the engine over a loopback HTTP
//! server, drives it through scripted commands, and relays the engine's
//! lifecycle events to a [`ReaderEventListener`] on a UI-affine
//! [`UiContext`].

pub mod codec;
pub mod config;
pub mod content_server;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod framed_renderer;
pub mod protocol;
pub mod session;
pub mod ui_context;
mod urls;

pub use crate::codec::{BookMetaData, ReaderTheme, RelocationInfo, TocItem};
pub use crate::config::ReaderConfig;
pub use crate::content_server::{ContentServer, ContentTarget};
pub use crate::dispatcher::{
    CommandDispatcher, PendingResult, ReaderCommand, Renderer, ScriptCallback,
};
pub use crate::error::{Error, Result};
pub use crate::events::{EventReceiver, ReaderEvent, ReaderEventListener};
pub use crate::framed_renderer::FramedRenderer;
pub use crate::session::ReaderSession;
pub use crate::ui_context::{DedicatedUiThread, SlintUiContext, UiContext, UiTask};
pub use serde_json;
