//! Blocking parallel-for over contiguous index ranges.
//!
//! Kernels hand over a range of independent work units. The range gets cut
//! into at most [threads] contiguous partitions that run on scoped worker
//! threads (or rayon's pool with the `rayon` feature), and the call returns
//! once every partition has finished. No pool is kept between calls in the
//! default build.
//!
//! Partitions never get smaller than [min_chunk] elements, so small tensors
//! run inline on the calling thread.

use std::sync::OnceLock;
use std::sync::atomic::{ AtomicUsize, Ordering };

/// Environment variable consulted once when no thread count has been set.
pub const THREADS_ENV: &str = "DENSEGRAD_NUM_THREADS";

const DEFAULT_MIN_CHUNK: usize = 4096;

static THREADS: AtomicUsize = AtomicUsize::new(0);
static MIN_CHUNK: AtomicUsize = AtomicUsize::new(DEFAULT_MIN_CHUNK);


/// Set the maximum number of workers. Zero restores automatic detection.

pub fn set_threads(n: usize) {
  THREADS.store(n, Ordering::Relaxed);
}

pub fn threads() -> usize {
  match THREADS.load(Ordering::Relaxed) {
    0 => detected_threads(),
    n => n,
  }
}

fn detected_threads() -> usize {
  static DETECTED: OnceLock<usize> = OnceLock::new();
  *DETECTED.get_or_init(|| {
    let from_env = std::env::var(THREADS_ENV).ok()
      .and_then(|value| value.trim().parse::<usize>().ok() )
      .filter(|&n| n > 0 );
    let n = from_env.unwrap_or_else(|| {
      std::thread::available_parallelism().map(|n| n.get() ).unwrap_or(1)
    });
    log::debug!("parallel: using {n} worker threads");
    n
  })
}

/// Set the smallest number of elements worth handing to a separate worker.

pub fn set_min_chunk(elements: usize) {
  MIN_CHUNK.store(elements.max(1), Ordering::Relaxed);
}

pub fn min_chunk() -> usize {
  MIN_CHUNK.load(Ordering::Relaxed)
}

// Number of units per partition, given the element cost of one unit
fn chunk_units(units: usize, unit_cost: usize) -> usize {
  let by_grain = (units * unit_cost.max(1) / min_chunk()).max(1);
  let workers = threads().min(units).min(by_grain).max(1);
  let chunk = (units + workers - 1) / workers;
  log::trace!("parallel: {units} units in {} partitions", (units + chunk - 1) / chunk);
  chunk
}


/// Run `work(start, end)` over a full, non-overlapping partition of `[0, n)`.

pub fn run<F>(n: usize, work: F)
where
  F: Fn(usize, usize) + Sync
{
  if n == 0 { return }
  let chunk = chunk_units(n, 1);
  if chunk >= n { return work(0, n) }
  run_partitions(n, chunk, &work);
}

#[cfg(not(feature = "rayon"))]
fn run_partitions<F>(n: usize, chunk: usize, work: &F)
where
  F: Fn(usize, usize) + Sync
{
  std::thread::scope(|scope| {
    let mut start = chunk;
    while start < n {
      let end = (start + chunk).min(n);
      scope.spawn(move || work(start, end) );
      start = end;
    }
    // First partition runs on the calling thread
    work(0, chunk);
  });
}

#[cfg(feature = "rayon")]
fn run_partitions<F>(n: usize, chunk: usize, work: &F)
where
  F: Fn(usize, usize) + Sync
{
  use rayon::prelude::*;
  let parts = (n + chunk - 1) / chunk;
  (0..parts).into_par_iter().for_each(|i| work(i * chunk, ((i + 1) * chunk).min(n)) );
}


/// Split `out` into rows of `unit` elements and hand each worker exclusive
/// access to a contiguous run of rows, along with the index of its first row.

pub fn split<F>(out: &mut [f64], unit: usize, work: F)
where
  F: Fn(usize, &mut [f64]) + Sync
{
  if out.is_empty() || unit == 0 { return }
  debug_assert_eq!(out.len() % unit, 0);
  let units = out.len() / unit;
  let chunk = chunk_units(units, unit);
  if chunk >= units { return work(0, out) }
  split_partitions(out, unit, chunk, &work);
}

#[cfg(not(feature = "rayon"))]
fn split_partitions<F>(out: &mut [f64], unit: usize, chunk: usize, work: &F)
where
  F: Fn(usize, &mut [f64]) + Sync
{
  std::thread::scope(|scope| {
    let mut parts = out.chunks_mut(chunk * unit).enumerate();
    let first = parts.next();
    for (i, part) in parts {
      scope.spawn(move || work(i * chunk, part) );
    }
    if let Some((_, part)) = first {
      work(0, part);
    }
  });
}

#[cfg(feature = "rayon")]
fn split_partitions<F>(out: &mut [f64], unit: usize, chunk: usize, work: &F)
where
  F: Fn(usize, &mut [f64]) + Sync
{
  use rayon::prelude::*;
  out.par_chunks_mut(chunk * unit)
    .enumerate()
    .for_each(|(i, part)| work(i * chunk, part) );
}


/// Sum the partial results of `term(start, end)` over a partition of `[0, n)`.
/// Partials are combined in partition order.

pub fn sum<F>(n: usize, term: F) -> f64
where
  F: Fn(usize, usize) -> f64 + Sync
{
  if n == 0 { return 0.0 }
  let chunk = chunk_units(n, 1);
  if chunk >= n { return term(0, n) }
  sum_partitions(n, chunk, &term)
}

#[cfg(not(feature = "rayon"))]
fn sum_partitions<F>(n: usize, chunk: usize, term: &F) -> f64
where
  F: Fn(usize, usize) -> f64 + Sync
{
  std::thread::scope(|scope| {
    let handles: Vec<_> = (chunk..n).step_by(chunk)
      .map(|start| scope.spawn(move || term(start, (start + chunk).min(n)) ))
      .collect();
    let first = term(0, chunk);
    handles.into_iter().fold(first, |acc, handle| {
      acc + handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic) )
    })
  })
}

#[cfg(feature = "rayon")]
fn sum_partitions<F>(n: usize, chunk: usize, term: &F) -> f64
where
  F: Fn(usize, usize) -> f64 + Sync
{
  use rayon::prelude::*;
  let parts = (n + chunk - 1) / chunk;
  let partials: Vec<f64> = (0..parts).into_par_iter()
    .map(|i| term(i * chunk, ((i + 1) * chunk).min(n)) )
    .collect();
  partials.iter().sum()
}


#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::sync::Mutex;

  // Settings are process-wide, so tests that change them run one at a time
  pub(crate) static SETTINGS: Mutex<()> = Mutex::new(());

  fn with_settings<R>(threads: usize, min_chunk: usize, f: impl FnOnce() -> R) -> R {
    let _guard = SETTINGS.lock().unwrap_or_else(|e| e.into_inner() );
    set_threads(threads);
    set_min_chunk(min_chunk);
    let out = f();
    set_threads(0);
    set_min_chunk(DEFAULT_MIN_CHUNK);
    out
  }

  #[test]
  fn run_covers_range_once() {
    with_settings(4, 1, || {
      let ranges = Mutex::new(vec![]);
      run(10, |start, end| ranges.lock().unwrap().push((start, end)) );
      let mut ranges = ranges.into_inner().unwrap();
      ranges.sort();
      assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
    });
  }

  #[test]
  fn run_empty_is_noop() {
    let calls = AtomicUsize::new(0);
    run(0, |_, _| { calls.fetch_add(1, Ordering::Relaxed); });
    assert_eq!(calls.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn small_ranges_run_inline() {
    with_settings(8, 1000, || {
      let ranges = Mutex::new(vec![]);
      run(10, |start, end| ranges.lock().unwrap().push((start, end)) );
      assert_eq!(ranges.into_inner().unwrap(), vec![(0, 10)]);
    });
  }

  #[test]
  fn split_writes_disjoint_rows() {
    with_settings(3, 1, || {
      let mut out = vec![0.0; 7 * 2];
      split(&mut out, 2, |first, rows| {
        for (r, row) in rows.chunks_mut(2).enumerate() {
          row[0] = (first + r) as f64;
          row[1] = -((first + r) as f64);
        }
      });
      let expected: Vec<f64> = (0..7).flat_map(|r| [r as f64, -(r as f64)] ).collect();
      assert_eq!(out, expected);
    });
  }

  #[test]
  fn parallel_sum() {
    with_settings(4, 1, || {
      let total = sum(1001, |start, end| (start..end).map(|i| i as f64 ).sum() );
      assert_eq!(total, 500500.0);
    });
  }
}
