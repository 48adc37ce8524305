use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use crate::codec::{self, ReaderTheme};
use crate::error::Result;

/// Receives the raw textual result of one script evaluation.
pub type ScriptCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// The scripting surface of an embedded renderer.
///
/// Implementations must invoke a supplied callback at most once per call. A
/// callback that is dropped without being invoked leaves the call unresolved.
pub trait Renderer: Send + Sync {
    fn load_url(&self, url: &str) -> Result<()>;

    fn evaluate_script(&self, script: &str, on_result: Option<ScriptCallback>) -> Result<()>;
}

impl<R: Renderer + ?Sized> Renderer for Arc<R> {
    fn load_url(&self, url: &str) -> Result<()> {
        (**self).load_url(url)
    }

    fn evaluate_script(&self, script: &str, on_result: Option<ScriptCallback>) -> Result<()> {
        (**self).evaluate_script(script, on_result)
    }
}

/// Operations exposed by the reading engine's global scope.
#[derive(Debug, Clone, Copy)]
pub enum ReaderCommand<'a> {
    Goto(&'a str),
    Next,
    Prev,
    GetTheme,
    SetTheme(&'a ReaderTheme),
    GetFlow,
    SetFlow(&'a str),
}

impl ReaderCommand<'_> {
    pub fn to_script(&self) -> Result<String> {
        Ok(match self {
            Self::Goto(locator) => format!("goto({})", codec::script_string_literal(locator)),
            Self::Next => "next()".to_string(),
            Self::Prev => "prev()".to_string(),
            Self::GetTheme => "getTheme()".to_string(),
            Self::SetTheme(theme) => format!("setTheme({})", codec::script_value_literal(theme)?),
            Self::GetFlow => "getFlow()".to_string(),
            Self::SetFlow(flow) => format!("setFlow({})", codec::script_string_literal(flow)),
        })
    }
}

pub struct CommandDispatcher<R> {
    renderer: R,
}

impl<R: Renderer> CommandDispatcher<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Submits `script`. With a callback, it receives the result once, minus
    /// the quotes the bridge wraps string results in.
    pub fn run(&self, script: &str, on_result: Option<ScriptCallback>) -> Result<()> {
        let on_result = on_result.map(|callback| -> ScriptCallback {
            Box::new(move |raw: String| callback(codec::unwrap_script_result(&raw).to_string()))
        });
        self.renderer.evaluate_script(script, on_result)
    }

    pub fn run_command(
        &self,
        command: ReaderCommand<'_>,
        on_result: Option<ScriptCallback>,
    ) -> Result<()> {
        self.run(&command.to_script()?, on_result)
    }

    /// Like [`run`](Self::run), returning a handle that resolves with the
    /// unwrapped result.
    pub fn call(&self, script: &str) -> Result<PendingResult> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.run(
            script,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        Ok(PendingResult { rx })
    }
}

/// A single in-flight script result.
#[derive(Debug)]
pub struct PendingResult {
    rx: Receiver<String>,
}

impl PendingResult {
    /// Blocks until the result arrives. `None` means the renderer dropped the
    /// call and it will never resolve.
    pub fn wait(self) -> Option<String> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }
}
