///
/// # Integration Test for tearing down a full free list
///
/// Fills the free list to its largest allowed length and tears the registry
/// down on a thread with a small stack. Runs in its own process because the
/// registry is process-wide.
///

use tether_std_core::{RuntimeConfig, ThreadsConfig, MAX_FREE_LIST_LIMIT};
use tether_std_threads::{registry, StartupPayload, Thread};

#[test]
fn test_teardown_of_long_free_list() {
    let config = RuntimeConfig {
        threads: ThreadsConfig {
            free_list_limit: MAX_FREE_LIST_LIMIT,
            ..ThreadsConfig::default()
        },
        ..RuntimeConfig::default()
    };
    config.validate().unwrap();
    assert!(registry::init(&config));

    // Create every record first so none of them reuses a recycled block.
    let records: Vec<_> = (0..MAX_FREE_LIST_LIMIT)
        .map(|_| {
            let payload = StartupPayload::new(&[], |_| Ok(vec![])).unwrap();
            Thread::create("recycled", true, payload).unwrap()
        })
        .collect();
    for (n, record) in records.iter().enumerate() {
        record.mark_started(n + 1, n as u64 + 1).unwrap();
        record.mark_dead().unwrap();
    }
    assert_eq!(registry::thread_count(), 0);
    assert_eq!(registry::free_list_len(), MAX_FREE_LIST_LIMIT);
    drop(records);

    let live = std::thread::Builder::new()
        .stack_size(64 * 1024)
        .spawn(registry::teardown)
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(live, 0);
    assert_eq!(registry::free_list_len(), 0);
    assert!(!registry::is_initialized());
}
