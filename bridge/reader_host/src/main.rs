mod console;

use std::path::PathBuf;
use std::process::{self, Child, Command, Stdio};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use reader_bridge_runtime::{
    BookMetaData, DedicatedUiThread, EventReceiver, FramedRenderer, ReaderConfig,
    ReaderEventListener, ReaderSession, Renderer, TocItem,
};

/// Headless host for an out-of-process reading engine.
#[derive(Parser, Debug)]
#[command(name = "reader_host", version)]
struct Args {
    /// Book to open once the renderer is up
    book: PathBuf,

    /// Renderer shell to spawn; it speaks the framed bridge protocol on stdio
    #[arg(long)]
    renderer: String,

    /// Extra argument for the renderer shell (repeatable)
    #[arg(long = "renderer-arg")]
    renderer_args: Vec<String>,

    /// Loopback port for the content server (overrides READER_CONTENT_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Bootstrap document of the reading engine (overrides READER_BOOTSTRAP_URL)
    #[arg(long)]
    bootstrap_url: Option<String>,

    /// Directory served under /assets/ (overrides READER_ASSET_ROOT)
    #[arg(long)]
    asset_root: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> ReaderConfig {
        let mut config = ReaderConfig::from_env();
        if let Some(port) = self.port {
            config.content_port = port;
        }
        if let Some(url) = &self.bootstrap_url {
            config.bootstrap_url = url.clone();
        }
        if let Some(root) = &self.asset_root {
            config.asset_root = Some(root.clone());
        }
        config
    }
}

struct LoggingListener;

impl ReaderEventListener for LoggingListener {
    fn on_book_loaded(&self, meta: BookMetaData) {
        info!(
            "book loaded: {} by {} ({} toc entries)",
            meta.title.as_deref().unwrap_or("untitled"),
            meta.author.as_deref().unwrap_or("unknown author"),
            meta.toc.len()
        );
    }

    fn on_book_load_failed(&self, error: String) {
        warn!("book failed to load: {error}");
    }

    fn on_progress_changed(&self, percent: u8, toc_item: Option<TocItem>) {
        match toc_item {
            Some(item) => info!("progress {percent}% in {} ({})", item.label, item.locator),
            None => info!("progress {percent}%"),
        }
    }

    fn on_text_selection_mode_change(&self, active: bool) {
        info!("text selection {}", if active { "started" } else { "ended" });
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("reader_host fatal error: {err}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config();
    let mut child = spawn_renderer(&args)?;

    let child_stdout = child.stdout.take().ok_or("renderer stdout not captured")?;
    let child_stdin = child.stdin.take().ok_or("renderer stdin not captured")?;

    let ui = DedicatedUiThread::spawn(config.ui_queue_cap)?;
    let receiver = EventReceiver::new(ui);
    let renderer = FramedRenderer::spawn(
        child_stdout,
        child_stdin,
        receiver.clone(),
        config.renderer_queue_cap,
    )?;

    let session = ReaderSession::new(config, renderer, receiver);
    session.set_listener(Some(Arc::new(LoggingListener)));
    session.open_book(&args.book)?;

    let console_result = console::run(&session, std::io::stdin().lock());

    teardown(session, &mut child);

    console_result.map_err(Into::into)
}

/// Stops serving before the renderer goes away, and reaps the renderer before
/// the session joins its writer: a renderer that stopped reading would
/// otherwise leave the writer blocked on a full pipe.
fn teardown<R: Renderer>(session: ReaderSession<R>, child: &mut Child) {
    session.close();
    shutdown_renderer(child);
    drop(session);
}

fn spawn_renderer(args: &Args) -> Result<Child, Box<dyn std::error::Error>> {
    info!("spawning renderer: {} {:?}", args.renderer, args.renderer_args);
    let child = Command::new(&args.renderer)
        .args(&args.renderer_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| format!("failed to spawn renderer '{}': {err}", args.renderer))?;
    Ok(child)
}

fn shutdown_renderer(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => info!("renderer exited with {status}"),
        Ok(None) => {
            if let Err(err) = child.kill() {
                warn!("failed to stop renderer: {err}");
            }
            if let Err(err) = child.wait() {
                error!("failed to reap renderer: {err}");
            }
        }
        Err(err) => error!("failed to query renderer status: {err}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn teardown_returns_when_the_renderer_stopped_reading() {
        // `sleep` never reads its stdin, so the pipe fills up.
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn sleep");
        let stdout = child.stdout.take().expect("stdout");
        let stdin = child.stdin.take().expect("stdin");

        let config = ReaderConfig {
            content_port: 0,
            ..ReaderConfig::default()
        };
        let ui = DedicatedUiThread::spawn(config.ui_queue_cap).expect("spawn ui thread");
        let receiver = EventReceiver::new(ui);
        let renderer =
            FramedRenderer::spawn(stdout, stdin, receiver.clone(), 4).expect("spawn renderer");
        let session = ReaderSession::new(config, renderer, receiver);

        let locator = "x".repeat(200_000);
        for _ in 0..3 {
            session.goto(&locator).expect("queue large goto");
        }

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            teardown(session, &mut child);
            done_tx.send(()).expect("signal");
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
    }
}
