use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Fire-and-forget tasks that can still be awaited when needed.
#[derive(Default)]
pub struct BackgroundTasks {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Wait for every task spawned so far, including ones spawned meanwhile.
  pub async fn settle(&self) {
    loop {
      let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        // Panics inside a refresh are not our caller's problem
        let _ = handle.await;
      }
    }
  }
}
