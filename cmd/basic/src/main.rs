//! Basic threadlet example
//!
//! Spawns a handful of cooperating threadlets on the main thread's event
//! loop and lets them yield round-robin until done.
//!
//! # Environment Variables
//!
//! - `WEFT_THREADLETS=<n>` - Number of threadlets to spawn (default: 3)
//! - `WEFT_YIELDS=<n>` - Yields per threadlet (default: 3)
//! - `WEFT_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{env_get, init_logging, run_until_idle, spawn, winfo, Context, Step, WaitOutcome};

// WEFT_LOG_LEVEL=debug cargo run -p weft-basic
fn main() {
    println!("=== weft basic example ===\n");
    init_logging();

    let num_threadlets: usize = env_get("WEFT_THREADLETS", 3);
    let num_yields: usize = env_get("WEFT_YIELDS", 3);
    println!("Threadlets: {}, yields each: {}\n", num_threadlets, num_yields);

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 0..num_threadlets {
        let completed = completed.clone();
        let mut left = num_yields;
        spawn(move |cx: &mut Context, _: WaitOutcome| {
            winfo!("threadlet {} (task {}) has {} yields left", i, cx.task_id(), left);
            println!("threadlet {}: {} yields left", i, left);
            if left == 0 {
                completed.fetch_add(1, Ordering::SeqCst);
                return Step::Finish;
            }
            left -= 1;
            Step::Yield
        })
        .expect("spawn failed");
    }

    run_until_idle().expect("event loop failed");
    println!("\ncompleted: {}/{}", completed.load(Ordering::SeqCst), num_threadlets);
}
