use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::driver::DeviceDriver;

/// Independent live-preview poller: continuously fetches screenshots and
/// overwrites a single frame file. Shares nothing mutable with the
/// execution worker beyond the driver handle and the stop flag.
pub fn spawn_preview(
    driver: Arc<dyn DeviceDriver>,
    dir: PathBuf,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame_path = dir.join("preview.png");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("⚠️ [Preview] cannot create {}: {}", dir.display(), e);
            return;
        }
        while !stop.load(Ordering::Relaxed) {
            match driver.screenshot().await {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&frame_path, &bytes) {
                        warn!("⚠️ [Preview] frame write failed: {}", e);
                    }
                }
                Err(e) => debug!("👁️ [Preview] screenshot unavailable: {}", e),
            }
            sleep(Duration::from_millis(500)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::FakeDriver;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_preview_writes_frames_and_stops() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(FakeDriver::login_screen());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_preview(driver, dir.path().to_path_buf(), stop.clone());

        sleep(Duration::from_millis(200)).await;
        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap();
        assert!(dir.path().join("preview.png").exists());
    }
}
