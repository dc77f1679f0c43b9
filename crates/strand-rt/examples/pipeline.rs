//! Small end-to-end tour: context inheritance, a timed-out lookup, and an
//! externally terminated straggler.
//!
//! Run with: cargo run -p strand-rt --example pipeline

use std::time::Duration;

use strand_rt::{
    block_on, context, go, install_fork_handler, sleep, spawn, timeout, Error, Promise,
};

fn main() {
    install_fork_handler();

    let outcome: Result<(), Error> = block_on(async {
        context::set("request_id", 42u64);

        // Workers inherit the request id snapshotted at spawn time.
        let workers: Vec<_> = (0..3u64)
            .map(|i| {
                spawn(async move {
                    sleep(Duration::from_millis(10 * (i + 1))).await;
                    let id = context::get_as::<u64>("request_id").unwrap();
                    Ok(format!("worker {i} done (request {id})"))
                })
            })
            .collect();

        for worker in workers {
            println!("{}", worker.await?);
        }

        // A lookup that never settles loses its race against the timer.
        let (slow, _resolver, _rejecter) = Promise::<String>::pending();
        match timeout(slow, Duration::from_millis(25)).await {
            Err(Error::TimedOut) => println!("slow lookup timed out"),
            other => println!("unexpected: {other:?}"),
        }

        // A straggler gets terminated from outside; its promise settles with
        // the termination error and the unit is never resumed.
        let (busy, handle) = go(async {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        handle.terminate();
        assert!(matches!(busy.await, Err(Error::Terminated)));
        println!("straggler terminated");

        Ok(())
    });

    if let Err(e) = outcome {
        eprintln!("pipeline failed: {e}");
    }
}
