#![allow(dead_code)] // Each test binary uses a different part of this module

pub mod mock_delivery;
pub mod mock_server;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tether_smtp::SessionInfo;

pub fn session() -> Arc<SessionInfo> {
    Arc::new(SessionInfo::new(
        SocketAddr::from(([127, 0, 0, 1], 40_000)),
        SocketAddr::from(([127, 0, 0, 1], 587)),
    ))
}

/// Poll `condition` until it holds, panicking after a couple of seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let wait = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(2), wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}
