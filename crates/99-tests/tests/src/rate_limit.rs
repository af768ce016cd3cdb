//! Rate limiting: a permit molecule re-granted after a delay spaces request
//! processing by at least that delay.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use retort::{reaction, Molecule, ReactionSite};

use crate::support::{pool, recv_exactly};

#[test]
fn requests_are_spaced_by_the_permit_delay() {
    const DELAY: Duration = Duration::from_millis(60);
    const REQUESTS: u32 = 6;

    let pool = pool("limiter", 2);
    let permit = Molecule::<()>::new("permit");
    let request = Molecule::<u32>::new("request");
    let (tx, rx) = unbounded();

    let incoming = request.clone();
    let regrant = permit.clone();
    let _site = ReactionSite::builder("limiter", &pool)
        .reaction(
            reaction("grant")
                .consume(&permit)
                .consume(&request)
                .body(move |scope| {
                    let id = scope.take(&incoming)?;
                    tx.send((id, Instant::now())).unwrap();
                    // The permit comes back only after the delay, which is
                    // what gates the next firing.
                    thread::sleep(DELAY);
                    regrant.emit(())?;
                    Ok(())
                }),
        )
        .activate()
        .expect("valid configuration");

    permit.emit(()).unwrap();
    for id in 0..REQUESTS {
        request.emit(id).unwrap();
    }

    let stamps = recv_exactly(&rx, REQUESTS as usize);
    let mut times: Vec<Instant> = stamps.iter().map(|(_, at)| *at).collect();
    times.sort();
    let slack = Duration::from_millis(15);
    for pair in times.windows(2) {
        let delta = pair[1] - pair[0];
        assert!(
            delta >= DELAY - slack,
            "outputs spaced {delta:?}, expected at least ~{DELAY:?}"
        );
    }
    pool.shutdown();
}
