//! Exit hook integration
//!
//! Kept in its own test binary: running the hooks drains the process-wide
//! registry, which would close children owned by unrelated tests.

#![cfg(unix)]

use childrpc_transport::exit_hook;
use childrpc_transport::{ProcessConfig, ProcessSupervisor};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_hooks_close_registered_children() {
    let auto = ProcessSupervisor::new(ProcessConfig::new("sleep").with_arg("30"));
    let manual = ProcessSupervisor::new(ProcessConfig::new("sleep").with_arg("30"));
    auto.start(true).await.unwrap();
    manual.start(false).await.unwrap();

    let dropped = ProcessSupervisor::new(ProcessConfig::new("sleep").with_arg("30"));
    dropped.start(true).await.unwrap();
    drop(dropped);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let removed = exit_hook::register(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(exit_hook::unregister(removed));

    let counter = Arc::clone(&calls);
    exit_hook::register(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    {
        let _guard = exit_hook::install();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(auto.has_exited());
    assert!(!manual.has_exited());

    // Hooks run once; the registry is empty afterwards
    assert_eq!(exit_hook::run_exit_hooks(), 0);

    tokio::time::timeout(Duration::from_secs(5), manual.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();
    auto.join_readers().await.unwrap();
}
