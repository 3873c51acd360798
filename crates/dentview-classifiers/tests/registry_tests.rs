//! Concurrency tests for lazy classifier initialization

use dentview_classifiers::{
    ClassifierConfig, ClassifierKind, ClassifierRegistry, StatisticalClassifier, ViewClassifier,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_concurrent_first_access_loads_once() {
    let temp_dir = TempDir::new().unwrap();
    let config = ClassifierConfig::default().with_models_dir(temp_dir.path());
    let loads = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&loads);
    let registry = Arc::new(ClassifierRegistry::with_loader(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        // Widen the race window
        std::thread::sleep(Duration::from_millis(50));
        Arc::new(StatisticalClassifier::untrained(&config)) as Arc<dyn ViewClassifier>
    })));

    let callers = 50;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                registry.get_classifier()
            })
        })
        .collect();

    let classifiers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(registry.load_count(), 1);
    let first = &classifiers[0];
    assert!(classifiers.iter().all(|c| Arc::ptr_eq(c, first)));
    assert_eq!(first.kind(), ClassifierKind::Statistical);
}

#[test]
fn test_reinitialize_during_reads() {
    let temp_dir = TempDir::new().unwrap();
    let config = ClassifierConfig::default().with_models_dir(temp_dir.path());
    let registry = Arc::new(ClassifierRegistry::new(config));
    registry.get_classifier();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    assert!(!registry.get_classifier().is_trained());
                }
            })
        })
        .collect();

    for _ in 0..5 {
        registry.reinitialize();
    }
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(registry.load_count(), 6);
}
