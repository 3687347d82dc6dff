//! 미디어 워커 기동과 감시

use crate::config::Config;
use crate::error::SfuError;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerSettings;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// mediasoup 워커를 하나 띄운다.
/// RTC 포트 범위는 트랜스포트마다 적용되므로 여기서는 검증만 한다.
pub async fn setup_server(manager: &WorkerManager, config: &Config) -> Result<Worker, SfuError> {
    if config.rtc.min_port > config.rtc.max_port {
        return Err(SfuError::ProvisioningFailed(format!(
            "invalid RTC port range {}-{}",
            config.rtc.min_port, config.rtc.max_port
        )));
    }

    let worker = manager
        .create_worker(WorkerSettings::default())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to start media worker");
            SfuError::ProvisioningFailed(e.to_string())
        })?;

    let worker_id = worker.id();
    worker
        .on_close(move || {
            tracing::info!(worker_id = %worker_id, "Media worker closed");
        })
        .detach();

    tracing::info!(
        worker_id = %worker.id(),
        rtc_min_port = config.rtc.min_port,
        rtc_max_port = config.rtc.max_port,
        "Media worker started"
    );
    Ok(worker)
}

/// 워커가 예기치 않게 죽으면 사유와 함께 완료되는 future.
/// 정상 종료로 핸들러가 사라지면 완료되지 않는다.
pub fn worker_died(worker: &Worker) -> impl Future<Output = String> + Send + 'static {
    let (tx, rx) = oneshot::channel();
    worker
        .on_dead(move |result| {
            let reason = match result {
                Ok(()) => "worker exited".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = tx.send(reason);
        })
        .detach();
    died_signal(rx)
}

async fn died_signal(rx: oneshot::Receiver<String>) -> String {
    match rx.await {
        Ok(reason) => reason,
        Err(_) => std::future::pending().await,
    }
}

/// 워커가 죽으면 유예 시간 후 `exit(1)` 을 호출한다.
///
/// 워커 없이 계속 동작하는 프로세스는 의미가 없으므로 종료해서 외부 슈퍼바이저가 재시작하게 한다.
pub async fn watch_worker<D, E>(died: D, grace: Duration, exit: E)
where
    D: Future<Output = String>,
    E: FnOnce(i32),
{
    let reason = died.await;
    tracing::error!(
        reason = %reason,
        grace_ms = grace.as_millis() as u64,
        "Media worker died, exiting"
    );
    tokio::time::sleep(grace).await;
    exit(1);
}
