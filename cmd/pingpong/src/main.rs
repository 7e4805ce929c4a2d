//! Two managed threads bouncing a counter through a shared handle
//!
//! Demonstrates the OS thread layer: staged arguments, per-thread wakeup
//! descriptors, WAKE signaling between peers, and ABORT as the shutdown
//! request.
//!
//! # Environment Variables
//!
//! - `WEFT_ROUNDS=<n>` - Number of round trips (default: 5)
//! - `WEFT_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace

use weft::{env_get, init_logging, os_thread, shared, SignalSet, WAIT_FOREVER};

fn player(name: &'static str) {
    let counter = os_thread::get_handle_arg(0).expect("counter arg");
    let rounds = os_thread::get_int_arg(1).expect("rounds arg") as u64;
    let peer_slot = os_thread::get_int_arg(2).expect("peer slot arg") as usize;

    loop {
        let set = os_thread::wait(WAIT_FOREVER).expect("wait");
        if set.is_abort() {
            break;
        }
        os_thread::clear_signals(SignalSet::WAKE).expect("clear");

        let peer = {
            let mut g = shared::acquire(counter, WAIT_FOREVER).expect("acquire");
            let state = g.value_mut::<GameState>().expect("state");
            state.count += 1;
            println!("{}: count = {}", name, state.count);
            if state.count >= rounds * 2 {
                state.over = true;
            }
            state.peers[peer_slot]
        };

        if peer.is_valid() {
            // Wake the other player; it aborts itself once the game is over
            os_thread::signal(peer, SignalSet::WAKE).expect("signal peer");
        }
        let over = {
            let g = shared::acquire(counter, WAIT_FOREVER).expect("acquire");
            g.value::<GameState>().expect("state").over
        };
        if over {
            break;
        }
    }
    shared::release(counter).expect("release");
    println!("{}: done", name);
}

struct GameState {
    count: u64,
    over: bool,
    peers: [weft::ShmHandle; 2],
}

fn main() {
    println!("=== weft pingpong example ===\n");
    init_logging();

    let rounds: i64 = env_get("WEFT_ROUNDS", 5);

    let counter = shared::wrap(GameState {
        count: 0,
        over: false,
        peers: [weft::ShmHandle::INVALID; 2],
    })
    .expect("wrap");

    let ping = os_thread::create("ping", || player("ping")).expect("create ping");
    let pong = os_thread::create("pong", || player("pong")).expect("create pong");

    // Each player looks up its peer by slot in the shared state
    {
        let mut g = shared::acquire(counter, WAIT_FOREVER).expect("acquire");
        g.value_mut::<GameState>().expect("state").peers = [pong, ping];
    }
    for (i, &th) in [ping, pong].iter().enumerate() {
        os_thread::set_handle_arg(th, 0, counter).expect("arg 0");
        os_thread::set_int_arg(th, 1, rounds).expect("arg 1");
        os_thread::set_int_arg(th, 2, i as i64).expect("arg 2");
        os_thread::start(th).expect("start");
    }

    // Serve
    os_thread::signal(ping, SignalSet::WAKE).expect("serve");

    os_thread::join(ping).expect("join ping");
    os_thread::join(pong).expect("join pong");
    os_thread::destroy(ping).expect("destroy ping");
    os_thread::destroy(pong).expect("destroy pong");
    shared::release(counter).expect("release");
    println!("\ngame over after {} round trips", rounds);
}
