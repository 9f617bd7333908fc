use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use medlipi::engine::Engine;
use medlipi::model::*;
use medlipi::notify::NotifyHub;

const HOUR: Ms = 3_600_000;

fn bench_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("medlipi_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path: PathBuf = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let notify = Arc::new(NotifyHub::new());
    Arc::new(Engine::new(path, notify).unwrap())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential_bookings() {
    let engine = bench_engine("phase1");
    let doctor = Ulid::new();

    let n_sessions = 20;
    let per_session = 100u32;
    let mut sessions = Vec::new();
    for i in 0..n_sessions {
        let sid = Ulid::new();
        let base = (i as Ms) * 2 * HOUR;
        engine
            .create_session(sid, doctor, Span::new(base, base + HOUR), per_session)
            .await
            .unwrap();
        sessions.push(sid);
    }

    let n = n_sessions * per_session as usize;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let sid = sessions[i / per_session as usize];
        let t = Instant::now();
        engine
            .book_serial(Ulid::new(), sid, Ulid::new())
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} bookings in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);
}

async fn phase2_contended_session() {
    let engine = bench_engine("phase2");
    let session = Ulid::new();
    let n_tasks = 8;
    let per_task = 125u32;
    let capacity = n_tasks as u32 * per_task;
    engine
        .create_session(session, Ulid::new(), Span::new(0, HOUR), capacity)
        .await
        .unwrap();

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                eng.book_serial(Ulid::new(), session, Ulid::new())
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {per_task} bookings on ONE session = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );

    // Sanity: the serialized critical section issued every serial once
    let bookings = engine.get_bookings(session).await.unwrap();
    let mut serials: Vec<u32> = bookings.iter().map(|b| b.serial).collect();
    serials.sort_unstable();
    assert_eq!(serials, (1..=capacity).collect::<Vec<u32>>());
    println!("  serials verified: 1..={capacity}, no duplicates, no gaps");
}

async fn phase3_parallel_sessions() {
    let engine = bench_engine("phase3");
    let n_tasks = 16;
    let per_task = 250u32;

    let mut sessions = Vec::new();
    for i in 0..n_tasks {
        let sid = Ulid::new();
        let base = (i as Ms) * 2 * HOUR;
        engine
            .create_session(sid, Ulid::new(), Span::new(base, base + HOUR), per_task)
            .await
            .unwrap();
        sessions.push(sid);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for sid in sessions {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                eng.book_serial(Ulid::new(), sid, Ulid::new())
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {per_task} bookings on {n_tasks} sessions = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_visit_writes() {
    let engine = bench_engine("phase4");
    let doctor = Ulid::new();

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let lines = vec![
            LineDraft {
                drug_id: Some(Ulid::new()),
                quantity: Some("10".into()),
                instruction: Some("1+0+1".into()),
                duration: Some("5 days".into()),
            },
            LineDraft {
                drug_id: Some(Ulid::new()),
                quantity: Some("6".into()),
                instruction: Some("0+0+1".into()),
                duration: Some("3 days".into()),
            },
        ];
        let t = Instant::now();
        engine
            .record_visit(
                doctor,
                PatientUpsert {
                    id: None,
                    name: Some(format!("patient {i}")),
                    ..Default::default()
                },
                lines,
                ClinicalFields {
                    diagnosis: Some("routine".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} two-line visits in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("visit write latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== medlipi stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential_bookings().await;

    println!("\n[phase 2] contended single-session bookings");
    phase2_contended_session().await;

    println!("\n[phase 3] parallel bookings across sessions");
    phase3_parallel_sessions().await;

    println!("\n[phase 4] visit batch writes");
    phase4_visit_writes().await;

    println!("\n=== benchmark complete ===");
}
