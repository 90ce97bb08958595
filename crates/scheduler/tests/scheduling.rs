//! End-to-end scheduler behavior: dispatch order, rule admission, and the
//! elastic worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use foreman_scheduler::{
    Job, JobScheduler, JobState, JobStatus, PathRule, Priority, SchedulerConfig,
};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn single_worker() -> JobScheduler {
    JobScheduler::with_config(SchedulerConfig {
        max_threads: 1,
        min_threads: 1,
        keep_alive: Duration::from_millis(200),
    })
}

/// A job that spins until the gate opens, pinning one worker.
fn gate_job(gate: &Arc<AtomicUsize>) -> Job {
    let gate = gate.clone();
    Job::builder("gate").body(move |_| {
        while gate.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(2));
        }
        JobStatus::Ok
    })
}

#[test]
fn test_priority_orders_dispatch_regardless_of_submission_order() {
    let scheduler = single_worker();
    let gate = Arc::new(AtomicUsize::new(0));
    let hog = gate_job(&gate);
    scheduler.schedule(&hog);

    let order = Arc::new(Mutex::new(Vec::new()));
    let levels = [
        Priority::Decorate,
        Priority::Build,
        Priority::Long,
        Priority::Short,
        Priority::Interactive,
    ];
    let mut jobs: Vec<(Priority, Job)> = levels
        .iter()
        .map(|&priority| {
            let order = order.clone();
            let job = Job::builder(format!("{:?}", priority))
                .priority(priority)
                .body(move |_| {
                    order.lock().unwrap().push(priority);
                    JobStatus::Ok
                });
            (priority, job)
        })
        .collect();
    jobs.shuffle(&mut rand::thread_rng());

    // all submissions land well inside the smallest non-zero delay bucket
    for (_, job) in &jobs {
        scheduler.schedule(job);
    }
    gate.store(1, Ordering::SeqCst);

    assert!(wait_until(Duration::from_secs(10), || {
        order.lock().unwrap().len() == levels.len()
    }));
    let order = order.lock().unwrap();
    let mut expected = levels.to_vec();
    expected.reverse();
    assert_eq!(*order, expected);
    scheduler.shutdown();
}

#[test]
fn test_conflicting_rules_serialize_even_when_submission_order_is_shuffled() {
    let scheduler = JobScheduler::with_config(SchedulerConfig {
        max_threads: 4,
        min_threads: 1,
        keep_alive: Duration::from_millis(200),
    });
    let shared = PathRule::shared("/store");
    let free = PathRule::shared("/elsewhere");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut jobs: Vec<Job> = (0..5)
        .map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            Job::builder(format!("writer-{}", i))
                .rule(shared.clone())
                .body(move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    JobStatus::Ok
                })
        })
        .collect();
    // unrelated jobs are free to interleave
    for i in 0..3 {
        jobs.push(
            Job::builder(format!("reader-{}", i))
                .rule(free.clone())
                .body(|_| JobStatus::Ok),
        );
    }
    jobs.shuffle(&mut rand::thread_rng());

    for job in &jobs {
        scheduler.schedule(job);
    }
    assert!(wait_until(Duration::from_secs(10), || {
        jobs.iter().all(|j| j.state() == JobState::None)
    }));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(scheduler.is_idle());
    assert!(scheduler.lock_manager().is_empty());
    scheduler.shutdown();
}

#[test]
fn test_nested_path_rules_serialize_in_any_submission_order() {
    let scheduler = JobScheduler::with_config(SchedulerConfig {
        max_threads: 4,
        min_threads: 1,
        keep_alive: Duration::from_millis(200),
    });
    // distinct handles along one containment chain; each pair conflicts
    let rules = [
        PathRule::shared("/a"),
        PathRule::shared("/a/b"),
        PathRule::shared("/a/b/c"),
    ];
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut jobs: Vec<Job> = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let active = active.clone();
            let peak = peak.clone();
            Job::builder(format!("nested-{}", i))
                .rule(rule.clone())
                .body(move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    JobStatus::Ok
                })
        })
        .collect();
    jobs.shuffle(&mut rand::thread_rng());

    for job in &jobs {
        scheduler.schedule(job);
    }
    assert!(wait_until(Duration::from_secs(10), || {
        jobs.iter().all(|j| j.state() == JobState::None)
    }));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(scheduler.is_idle());
    scheduler.shutdown();
}

#[test]
fn test_begin_rule_waits_for_conflicting_running_job() {
    let scheduler = single_worker();
    let rule = PathRule::shared("/area");
    let gate = Arc::new(AtomicUsize::new(0));
    let job = {
        let gate = gate.clone();
        Job::builder("occupant").rule(rule.clone()).body(move |_| {
            while gate.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(2));
            }
            JobStatus::Ok
        })
    };
    scheduler.schedule(&job);
    assert!(wait_until(Duration::from_secs(5), || {
        job.state() == JobState::Running
    }));

    let scheduler = Arc::new(scheduler);
    let entered = Arc::new(AtomicUsize::new(0));
    let claimer = {
        let scheduler = scheduler.clone();
        let rule = rule.clone();
        let entered = entered.clone();
        thread::spawn(move || {
            scheduler.begin_rule(Some(rule.clone())).unwrap();
            entered.store(1, Ordering::SeqCst);
            scheduler.end_rule(Some(&rule)).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(entered.load(Ordering::SeqCst), 0);

    gate.store(1, Ordering::SeqCst);
    claimer.join().unwrap();
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert!(scheduler.lock_manager().is_empty());
    scheduler.shutdown();
}

#[test]
fn test_pool_grows_under_load_and_shrinks_when_idle() {
    let scheduler = JobScheduler::with_config(SchedulerConfig {
        max_threads: 3,
        min_threads: 1,
        keep_alive: Duration::from_millis(150),
    });
    let jobs: Vec<Job> = (0..9)
        .map(|i| {
            Job::builder(format!("load-{}", i)).body(|_| {
                thread::sleep(Duration::from_millis(60));
                JobStatus::Ok
            })
        })
        .collect();
    for job in &jobs {
        scheduler.schedule(job);
    }

    // the pool grows but stays within the cap for non-interactive work
    let mut observed_max = 0;
    while !jobs.iter().all(|j| j.state() == JobState::None) {
        observed_max = observed_max.max(scheduler.worker_count());
        assert!(scheduler.worker_count() <= 3);
        thread::sleep(Duration::from_millis(10));
    }
    assert!(observed_max >= 2, "expected the pool to grow, saw {}", observed_max);

    // idle workers above min_threads expire after keep_alive
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.worker_count() <= 1
    }));
    scheduler.shutdown();
    assert_eq!(scheduler.worker_count(), 0);
}

#[test]
fn test_interactive_job_bypasses_the_thread_cap() {
    let scheduler = single_worker();
    let gate = Arc::new(AtomicUsize::new(0));
    let hog = gate_job(&gate);
    scheduler.schedule(&hog);
    assert!(wait_until(Duration::from_secs(5), || {
        hog.state() == JobState::Running
    }));

    let ran = Arc::new(AtomicUsize::new(0));
    let urgent = {
        let ran = ran.clone();
        Job::builder("urgent")
            .priority(Priority::Interactive)
            .body(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                JobStatus::Ok
            })
    };
    scheduler.schedule(&urgent);

    // runs even though the only regular worker is pinned
    assert!(wait_until(Duration::from_secs(5), || {
        ran.load(Ordering::SeqCst) == 1
    }));
    gate.store(1, Ordering::SeqCst);
    scheduler.shutdown();
}

#[test]
fn test_pool_returns_to_cap_after_interactive_overflow() {
    // a long keep_alive so only the capacity check can shrink the pool
    let scheduler = JobScheduler::with_config(SchedulerConfig {
        max_threads: 1,
        min_threads: 1,
        keep_alive: Duration::from_secs(60),
    });
    let gate = Arc::new(AtomicUsize::new(0));
    let hog = gate_job(&gate);
    scheduler.schedule(&hog);
    assert!(wait_until(Duration::from_secs(5), || {
        hog.state() == JobState::Running
    }));

    let urgent = Job::builder("urgent")
        .priority(Priority::Interactive)
        .body(|_| JobStatus::Ok);
    scheduler.schedule(&urgent);
    assert!(wait_until(Duration::from_secs(5), || {
        urgent.state() == JobState::None
    }));

    // once the work is done the overflow worker exits instead of idling
    gate.store(1, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.worker_count() <= 1
    }));
    scheduler.shutdown();
}

#[test]
fn test_job_scheduled_against_an_idle_pool_runs_promptly() {
    // a keep_alive far beyond the test budget; a lost wakeup would stall
    let scheduler = JobScheduler::with_config(SchedulerConfig {
        max_threads: 2,
        min_threads: 1,
        keep_alive: Duration::from_secs(60),
    });
    let ran = Arc::new(AtomicUsize::new(0));
    for round in 1..=10 {
        let job = {
            let ran = ran.clone();
            Job::builder("ping").body(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                JobStatus::Ok
            })
        };
        scheduler.schedule(&job);
        assert!(
            wait_until(Duration::from_secs(2), || {
                ran.load(Ordering::SeqCst) == round
            }),
            "round {} never ran",
            round
        );
    }
    scheduler.shutdown();
}

#[test]
fn test_shutdown_waits_for_running_jobs() {
    let scheduler = single_worker();
    let finished = Arc::new(AtomicUsize::new(0));
    let job = {
        let finished = finished.clone();
        Job::builder("winding-down").body(move |token| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(2));
            }
            finished.store(1, Ordering::SeqCst);
            JobStatus::Cancelled
        })
    };
    scheduler.schedule(&job);
    assert!(wait_until(Duration::from_secs(5), || {
        job.state() == JobState::Running
    }));

    // shutdown cancels the token and joins the worker
    scheduler.shutdown();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.worker_count(), 0);
}
