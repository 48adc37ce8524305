use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::codec::{self, ReaderTheme};
use crate::config::ReaderConfig;
use crate::content_server::{self, ContentServer, ContentTarget};
use crate::dispatcher::{CommandDispatcher, ReaderCommand, Renderer, ScriptCallback};
use crate::error::Result;
use crate::events::{EventReceiver, ReaderEventListener};
use crate::ui_context::UiContext;
use crate::urls;

/// Native control surface over one embedded reading engine.
///
/// The session owns the content server; closing or dropping the session
/// stops it. Opening a book again after `close` brings it back. Result
/// callbacks run on the UI context of the event receiver.
pub struct ReaderSession<R: Renderer> {
    config: ReaderConfig,
    dispatcher: CommandDispatcher<R>,
    receiver: EventReceiver,
    server: ContentServer,
    lifecycle: Arc<Lifecycle>,
}

/// Open flag plus a generation bumped on every `close`, so results issued
/// before a close stay unresolved after the session is reopened.
#[derive(Debug)]
struct Lifecycle {
    open: AtomicBool,
    generation: AtomicU64,
}

impl Lifecycle {
    fn current(&self) -> Option<u64> {
        let generation = self.generation.load(Ordering::Acquire);
        self.open.load(Ordering::Acquire).then_some(generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current() == Some(generation)
    }
}

impl<R: Renderer> ReaderSession<R> {
    pub fn new(config: ReaderConfig, renderer: R, receiver: EventReceiver) -> Self {
        let server = ContentServer::new(&config);
        Self {
            config,
            dispatcher: CommandDispatcher::new(renderer),
            receiver,
            server,
            lifecycle: Arc::new(Lifecycle {
                open: AtomicBool::new(true),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn renderer(&self) -> &R {
        self.dispatcher.renderer()
    }

    pub fn event_receiver(&self) -> &EventReceiver {
        &self.receiver
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn ReaderEventListener>>) {
        self.receiver.set_listener(listener);
    }

    pub fn content_origin(&self) -> Option<String> {
        self.server.origin()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.current().is_some()
    }

    /// Serves the book at `path` and points the engine at it. Whether the
    /// book actually loads is reported through the event listener.
    pub fn open_book(&self, path: impl AsRef<Path>) -> Result<()> {
        self.open(ContentTarget::File(path.as_ref().to_path_buf()))
    }

    /// Like [`open_book`](Self::open_book) for a book held in memory. `name`
    /// doubles as the locator and its extension picks the content type.
    pub fn open_bytes(&self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Result<()> {
        self.open(ContentTarget::Bytes {
            name: name.into(),
            data: data.into(),
        })
    }

    fn open(&self, target: ContentTarget) -> Result<()> {
        let locator = target.locator();
        let origin = self.server.serve(target)?;
        if !self.lifecycle.open.swap(true, Ordering::AcqRel) {
            info!("reopening reader session");
        }
        let url = reader_url(&self.config.bootstrap_url, &origin, &locator);

        info!("opening {locator}");
        debug!("navigating renderer to {url}");
        self.renderer().load_url(&url)
    }

    pub fn goto(&self, locator: &str) -> Result<()> {
        self.dispatcher.run_command(ReaderCommand::Goto(locator), None)
    }

    pub fn next(&self) -> Result<()> {
        self.dispatcher.run_command(ReaderCommand::Next, None)
    }

    pub fn prev(&self) -> Result<()> {
        self.dispatcher.run_command(ReaderCommand::Prev, None)
    }

    pub fn get_theme<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(ReaderTheme) + Send + 'static,
    {
        let on_result = self.on_ui(move |raw: String| match codec::decode_theme(&raw) {
            Ok(theme) => Some(move || callback(theme)),
            Err(err) => {
                warn!("dropping getTheme() result: {err}");
                None
            }
        });
        self.dispatcher.run_command(ReaderCommand::GetTheme, Some(on_result))
    }

    pub fn set_theme(&self, theme: &ReaderTheme) -> Result<()> {
        self.dispatcher.run_command(ReaderCommand::SetTheme(theme), None)
    }

    pub fn get_flow<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let on_result = self.on_ui(move |raw: String| {
            let flow = codec::decode_flow(&raw);
            Some(move || callback(flow))
        });
        self.dispatcher.run_command(ReaderCommand::GetFlow, Some(on_result))
    }

    pub fn set_flow(&self, flow: &str) -> Result<()> {
        self.dispatcher.run_command(ReaderCommand::SetFlow(flow), None)
    }

    /// Tears the session down: the content server stops and results still in
    /// flight are discarded without reaching their callbacks, even if a book
    /// is opened again later.
    pub fn close(&self) {
        if self.lifecycle.open.swap(false, Ordering::AcqRel) {
            self.lifecycle.generation.fetch_add(1, Ordering::AcqRel);
            info!("closing reader session");
        }
        self.server.stop();
    }

    /// Wraps a result handler so that decoding happens on the arrival thread
    /// and the produced continuation runs on the UI context, unless the
    /// session has been closed since the command was issued.
    fn on_ui<D, C>(&self, decode: D) -> ScriptCallback
    where
        D: FnOnce(String) -> Option<C> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let lifecycle = self.lifecycle.clone();
        let issued = lifecycle.current();
        let ui: Arc<dyn UiContext> = self.receiver.ui().clone();

        Box::new(move |raw: String| {
            let Some(generation) = issued.filter(|g| lifecycle.is_current(*g)) else {
                debug!("session closed; discarding script result");
                return;
            };

            let Some(continuation) = decode(raw) else {
                return;
            };

            let posted = ui.post(Box::new(move || {
                if lifecycle.is_current(generation) {
                    continuation();
                }
            }));
            if let Err(err) = posted {
                warn!("failed to post script result: {err}");
            }
        })
    }
}

impl<R: Renderer> Drop for ReaderSession<R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// `<bootstrap>?url=<origin?url=<locator>>`, each level percent-encoded.
pub fn reader_url(bootstrap_url: &str, origin: &str, locator: &str) -> String {
    let book_url = content_server::resource_url(origin, locator);
    urls::append_query_param(bootstrap_url, "url", &book_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_url_nests_the_encoded_book_url() {
        let url = reader_url(
            "https://appassets.androidplatform.net/assets/ebook-reader/reader.html",
            "http://localhost:8080/",
            "/sdcard/book.epub",
        );

        assert_eq!(
            url,
            "https://appassets.androidplatform.net/assets/ebook-reader/reader.html\
             ?url=http%3A%2F%2Flocalhost%3A8080%2F%3Furl%3D%252Fsdcard%252Fbook.epub"
        );
    }

    #[test]
    fn reader_url_decodes_back_to_the_served_locator() {
        let url = reader_url("http://localhost:9/assets/reader.html?debug=1", "http://localhost:9/", "/b/a b&c.epub");

        let (_, query) = url.split_once('?').expect("query");
        let book_url = urls::decode_component(urls::query_param(query, "url").expect("url"))
            .expect("utf8")
            .into_owned();
        assert!(book_url.starts_with("http://localhost:9/?url="));

        let (_, inner_query) = book_url.split_once('?').expect("inner query");
        let locator = urls::decode_component(urls::query_param(inner_query, "url").expect("url"))
            .expect("utf8")
            .into_owned();
        assert_eq!(locator, "/b/a b&c.epub");
    }
}
