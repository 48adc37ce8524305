use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::codec::{self, BookMetaData, TocItem};
use crate::ui_context::UiContext;

pub const BOOK_LOADED: &str = "onBookLoaded";
pub const BOOK_LOAD_FAILED: &str = "onBookLoadFailed";
pub const RELOCATED: &str = "onRelocated";
pub const SELECTION_START: &str = "onSelectionStart";
pub const SELECTION_END: &str = "onSelectionEnd";

/// Observer of reading-engine lifecycle events. Always invoked on the UI
/// context.
pub trait ReaderEventListener: Send + Sync {
    fn on_book_loaded(&self, meta: BookMetaData);
    fn on_book_load_failed(&self, error: String);
    fn on_progress_changed(&self, percent: u8, toc_item: Option<TocItem>);
    fn on_text_selection_mode_change(&self, active: bool);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    BookLoaded(BookMetaData),
    BookLoadFailed(String),
    ProgressChanged {
        percent: u8,
        toc_item: Option<TocItem>,
    },
    TextSelectionModeChanged(bool),
}

impl ReaderEvent {
    fn deliver(self, listener: &dyn ReaderEventListener) {
        match self {
            Self::BookLoaded(meta) => listener.on_book_loaded(meta),
            Self::BookLoadFailed(error) => listener.on_book_load_failed(error),
            Self::ProgressChanged { percent, toc_item } => {
                listener.on_progress_changed(percent, toc_item)
            }
            Self::TextSelectionModeChanged(active) => {
                listener.on_text_selection_mode_change(active)
            }
        }
    }
}

type ListenerSlot = Arc<Mutex<Option<Arc<dyn ReaderEventListener>>>>;

/// Entry points the reading engine calls into. Each one decodes its payload on
/// the calling thread and enqueues delivery onto the UI context.
#[derive(Clone)]
pub struct EventReceiver {
    ui: Arc<dyn UiContext>,
    listener: ListenerSlot,
}

impl EventReceiver {
    pub fn new(ui: Arc<dyn UiContext>) -> Self {
        Self {
            ui,
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn ui(&self) -> &Arc<dyn UiContext> {
        &self.ui
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn ReaderEventListener>>) {
        match self.listener.lock() {
            Ok(mut slot) => *slot = listener,
            Err(poisoned) => *poisoned.into_inner() = listener,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn on_book_loaded(&self, book_json: &str) {
        match codec::decode_book_metadata(book_json) {
            Ok(meta) => self.emit(ReaderEvent::BookLoaded(meta)),
            Err(err) => warn!("dropping {BOOK_LOADED} event: {err}"),
        }
    }

    pub fn on_book_load_failed(&self, error: &str) {
        self.emit(ReaderEvent::BookLoadFailed(error.to_string()));
    }

    pub fn on_relocated(&self, relocation_json: &str) {
        match codec::decode_relocation(relocation_json) {
            Ok(info) => self.emit(ReaderEvent::ProgressChanged {
                percent: info.percent(),
                toc_item: info.toc_item,
            }),
            Err(err) => warn!("dropping {RELOCATED} event: {err}"),
        }
    }

    pub fn on_selection_start(&self) {
        self.emit(ReaderEvent::TextSelectionModeChanged(true));
    }

    pub fn on_selection_end(&self) {
        self.emit(ReaderEvent::TextSelectionModeChanged(false));
    }

    /// Routes an event by its engine-side name.
    pub fn dispatch(&self, name: &str, arg: Option<&str>) {
        match (name, arg) {
            (BOOK_LOADED, Some(arg)) => self.on_book_loaded(arg),
            (BOOK_LOAD_FAILED, arg) => self.on_book_load_failed(arg.unwrap_or("")),
            (RELOCATED, Some(arg)) => self.on_relocated(arg),
            (SELECTION_START, _) => self.on_selection_start(),
            (SELECTION_END, _) => self.on_selection_end(),
            (BOOK_LOADED | RELOCATED, None) => warn!("dropping {name} event: missing payload"),
            _ => warn!("ignoring unknown reader event: {name}"),
        }
    }

    fn emit(&self, event: ReaderEvent) {
        let slot = self.listener.clone();
        let posted = self.ui.post(Box::new(move || {
            // Read the slot on the UI context so a listener swapped by an
            // earlier task is honoured.
            let listener = match slot.lock() {
                Ok(slot) => slot.clone(),
                Err(_) => None,
            };
            match listener {
                Some(listener) => event.deliver(listener.as_ref()),
                None => debug!("no reader listener registered; event dropped"),
            }
        }));

        if let Err(err) = posted {
            warn!("failed to post reader event: {err}");
        }
    }
}

impl std::fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReceiver")
            .field("has_listener", &self.has_listener())
            .finish_non_exhaustive()
    }
}
