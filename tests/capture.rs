//! Live captures of this test process.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use backtrack::{Backtracer, CaptureConfig, ThreadRole, ThreadStatus};

#[inline(never)]
fn level_one(backtracer: &Backtracer) -> backtrack::BacktraceReport {
    let report = level_two(backtracer);
    black_box(report)
}

#[inline(never)]
fn level_two(backtracer: &Backtracer) -> backtrack::BacktraceReport {
    let report = level_three(backtracer);
    black_box(report)
}

#[inline(never)]
fn level_three(backtracer: &Backtracer) -> backtrack::BacktraceReport {
    black_box(backtracer.capture_current_thread())
}

fn frame_index(names: &[String], needle: &str) -> usize {
    names
        .iter()
        .position(|name| name.contains(needle))
        .unwrap_or_else(|| panic!("{needle} missing from {names:#?}"))
}

#[test]
fn test_three_nested_calls_innermost_first() {
    backtrack::init();
    let backtracer = Backtracer::default();
    let report = level_one(&backtracer);

    assert_eq!(report.threads.len(), 1);
    let thread = &report.threads[0];
    assert_eq!(thread.role, ThreadRole::Current);
    assert_eq!(thread.thread.tid, backtrack::thread::current_tid());

    let names: Vec<String> = thread
        .frames
        .iter()
        .filter_map(|frame| frame.symbol.as_ref()?.name.clone())
        .collect();
    // The capture machinery itself never shows: the deepest call comes first.
    assert!(thread.frames[0].symbol.is_some(), "{report}");
    let three = frame_index(&names, "level_three");
    let two = frame_index(&names, "level_two");
    let one = frame_index(&names, "level_one");
    assert_eq!(three, 0, "{names:#?}");
    assert_eq!((two, one), (1, 2), "{names:#?}");
    assert!(names.iter().all(|name| !name.contains("backtrack::")), "{names:#?}");
}

#[inline(never)]
fn text_from_here() -> String {
    black_box(backtrack::stack_backtrace_of_current_thread())
}

#[inline(never)]
fn text_one_level_up() -> String {
    black_box(text_from_here())
}

#[test]
fn test_free_function_starts_at_its_caller() {
    let text = text_one_level_up();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[1].starts_with("0   ") && lines[1].contains("text_from_here"), "{text}");
    assert!(lines[2].starts_with("1   ") && lines[2].contains("text_one_level_up"), "{text}");
}

/// Calls `f` from `depth` nested frames of this crate.
#[inline(never)]
fn nested(depth: u32, f: &dyn Fn() -> backtrack::BacktraceReport) -> backtrack::BacktraceReport {
    if depth == 0 {
        return black_box(f());
    }
    black_box(nested(depth - 1, f))
}

#[test]
fn test_current_thread_text() {
    let text = backtrack::stack_backtrace_of_current_thread();
    let header = text.lines().next().unwrap();
    assert!(header.starts_with("Backtrace of thread "), "{text}");
    assert!(header.contains("[current]"), "{text}");
    assert!(text.lines().nth(1).unwrap().starts_with("0   "), "{text}");
}

#[test]
fn test_main_thread_from_a_test_thread() {
    backtrack::init();
    let text = backtrack::stack_backtrace_of_main_thread();
    let main_tid = std::process::id() as i32;
    assert!(
        text.starts_with(&format!("Backtrace of thread {main_tid} [main]")),
        "{text}"
    );
    assert!(!text.contains("-- unavailable"), "{text}");
    assert!(text.lines().nth(1).is_some_and(|line| line.starts_with("0   ")), "{text}");
}

#[test]
fn test_all_threads_includes_named_workers() {
    backtrack::init();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(3));
    let workers: Vec<_> = (0..2)
        .map(|i| {
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::Builder::new()
                .name(format!("bt-worker-{i}"))
                .spawn(move || {
                    ready.wait();
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(2));
                    }
                })
                .unwrap()
        })
        .collect();
    ready.wait();

    let report = Backtracer::default().capture_all_threads();
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(!report.enumeration_failed);
    for name in ["bt-worker-0", "bt-worker-1"] {
        let worker = report
            .threads
            .iter()
            .find(|t| t.thread.name == name)
            .unwrap_or_else(|| panic!("{name} missing:\n{report}"));
        assert!(matches!(worker.role, ThreadRole::Other(_)));
        assert!(!worker.frames.is_empty());
    }
    let me = backtrack::thread::current_tid();
    assert!(report.threads.iter().any(|t| t.thread.tid == me && t.role == ThreadRole::Current));

    let text = report.to_string();
    let blocks = text.split("\n\n").count();
    assert_eq!(blocks, report.threads.len());
}

#[test]
fn test_depth_limit_is_marked() {
    let backtracer = Backtracer::new(CaptureConfig::default().with_max_depth(2));
    let report = nested(4, &|| backtracer.capture_current_thread());
    let thread = &report.threads[0];
    assert_eq!(thread.frames.len(), 2);
    assert_eq!(thread.status, ThreadStatus::Walked(backtrack::Termination::DepthLimit(2)));
    assert!(report.to_string().contains("    -- truncated: depth limit 2 reached"));
}

#[test]
fn test_registers_and_images_on_request() {
    let config = CaptureConfig::default().with_registers(true).with_images(true);
    let report = Backtracer::new(config).capture_current_thread();
    assert!(report.threads[0].registers.is_some());
    assert!(!report.images.is_empty());

    let text = report.to_string();
    assert!(text.lines().nth(1).unwrap().starts_with("    pc 0x"), "{text}");
    assert!(text.contains("\nBinary images:\n"), "{text}");
}

#[test]
fn test_unsymbolicated_frames() {
    let report = Backtracer::new(CaptureConfig::default().with_symbolicate(false)).capture_current_thread();
    let thread = &report.threads[0];
    assert!(!thread.frames.is_empty());
    assert!(thread.frames.iter().all(|frame| frame.symbol.is_none()));
    assert!(report.to_string().lines().nth(1).unwrap().starts_with("0   ???"));
}
