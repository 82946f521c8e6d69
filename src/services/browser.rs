//! Headless browser rendering for the snapshot worker.
//!
//! One [`ManagedBrowser`] is owned by each worker process and shared by its
//! snapshot executors. A crashed browser is detected on the next render, and
//! one that stops answering is discarded after a failed render, so the next
//! job relaunches it instead of timing out like the last one.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const VIEWPORT_WIDTH: u32 = 1280;
pub const VIEWPORT_HEIGHT: u32 = 800;
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// What a render produced: the post-JavaScript DOM and a viewport screenshot.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub screenshot: Vec<u8>,
    /// URL after redirects.
    pub final_url: String,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Load `url` and capture its DOM and screenshot, bounded by the renderer's timeout.
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError>;

    /// Release any process resources. Later renders may relaunch.
    async fn shutdown(&self) {}
}

struct Session {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
}

impl Session {
    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }
}

/// Chromium instance reused across jobs, relaunched when it dies.
pub struct ManagedBrowser {
    executable: Option<String>,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl ManagedBrowser {
    pub fn new(executable: Option<String>, timeout: Duration) -> Self {
        Self {
            executable,
            timeout,
            session: Mutex::new(None),
        }
    }

    /// Whether `browser` answers a protocol round-trip.
    async fn responds(browser: &Browser) -> bool {
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, browser.version()).await,
            Ok(Ok(_))
        )
    }

    /// Health-check the browser behind a failed render and drop it if it no
    /// longer answers.
    async fn recover(&self, browser: &Arc<Browser>, error: &RenderError) {
        if matches!(error, RenderError::Launch(_)) {
            return;
        }
        let healthy = Self::responds(browser).await;
        if should_discard(error, healthy) {
            tracing::warn!(error = %error, "Browser unresponsive, discarding it");
            metrics::counter!("browser_discards_total").increment(1);
            self.discard(browser).await;
        }
    }

    async fn launch(&self) -> Result<Session, RenderError> {
        let mut builder = BrowserConfig::builder()
            .window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT)
            .viewport(Viewport {
                width: VIEWPORT_WIDTH,
                height: VIEWPORT_HEIGHT,
                ..Default::default()
            })
            .request_timeout(self.timeout)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--mute-audio");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(RenderError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser connection closed");
                    break;
                }
            }
        });

        tracing::info!("Launched headless browser");
        metrics::counter!("browser_launches_total").increment(1);

        Ok(Session {
            browser: Arc::new(browser),
            handler,
        })
    }

    /// Current browser, relaunching it if the previous one crashed.
    async fn browser(&self) -> Result<Arc<Browser>, RenderError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                return Ok(session.browser.clone());
            }
            tracing::warn!("Browser process died, relaunching");
        }
        let session = self.launch().await?;
        let browser = session.browser.clone();
        if let Some(old) = guard.replace(session) {
            old.handler.abort();
        }
        Ok(browser)
    }

    /// Forget the current browser so the next render starts a fresh one.
    async fn discard(&self, stale: &Arc<Browser>) {
        let mut guard = self.session.lock().await;
        let is_current = guard
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.browser, stale));
        if is_current {
            if let Some(session) = guard.take() {
                session.handler.abort();
            }
        }
    }

    async fn capture(&self, page: &Page, url: &str) -> Result<RenderedPage, RenderError> {
        page
            .set_user_agent(SetUserAgentOverrideParams::new(USER_AGENT))
            .await?;
        page.goto(url).await?;
        page.wait_for_navigation().await?;

        let html = page.content().await?;
        let final_url = page.url().await?.unwrap_or_else(|| url.to_string());
        let screenshot = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(false)
                    .build(),
            )
            .await?;

        Ok(RenderedPage {
            html,
            screenshot,
            final_url,
        })
    }
}

/// Whether a browser should be dropped after `error`, given whether it still
/// answered a health check. Launch failures leave no session behind.
fn should_discard(error: &RenderError, healthy: bool) -> bool {
    match error {
        RenderError::Launch(_) => false,
        RenderError::Browser(_) | RenderError::Timeout { .. } => !healthy,
    }
}

/// An async cleanup that runs exactly once: awaited through [`run`], or
/// spawned onto the runtime if the guard is dropped first.
///
/// [`run`]: DeferredClose::run
struct DeferredClose {
    close: Option<BoxFuture<'static, ()>>,
}

impl DeferredClose {
    fn new(close: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            close: Some(close.boxed()),
        }
    }

    async fn run(mut self) {
        if let Some(close) = self.close.take() {
            close.await;
        }
    }
}

impl Drop for DeferredClose {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(close);
            }
        }
    }
}

async fn close_tab(page: Page) {
    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, page.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Failed to close browser tab"),
        Err(_) => tracing::debug!("Timed out closing browser tab"),
    }
}

#[async_trait]
impl PageRenderer for ManagedBrowser {
    /// The timeout bounds the whole step: launch, tab and capture.
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = || RenderError::Timeout {
            url: url.to_string(),
            timeout: self.timeout,
        };

        let browser = tokio::time::timeout_at(deadline, self.browser())
            .await
            .map_err(|_| timed_out())??;

        let page = match tokio::time::timeout_at(deadline, browser.new_page("about:blank")).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                // A browser that cannot open a tab is unusable.
                self.discard(&browser).await;
                return Err(RenderError::Browser(e));
            }
            Err(_) => {
                self.discard(&browser).await;
                return Err(timed_out());
            }
        };
        let tab = DeferredClose::new(close_tab(page.clone()));

        let result = match tokio::time::timeout_at(deadline, self.capture(&page, url)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out()),
        };
        tab.run().await;

        if let Err(e) = &result {
            self.recover(&browser, e).await;
        }
        result
    }

    async fn shutdown(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(session.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    tracing::warn!(error = %e, "Failed to close browser cleanly");
                }
                let _ = browser.wait().await;
            }
            Err(_) => tracing::warn!("Browser still in use at shutdown, killing it"),
        }
        session.handler.abort();
        tracing::info!("Headless browser stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser error: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),

    #[error("Rendering {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}
