//! Minimal end-to-end demo: publish a timeline with no network and watch
//! common time advance.
//!
//! Run with: cargo run --example networkless_master

use std::sync::Arc;
use std::time::Duration;

use common_time::clock::SystemLocalClock;
use common_time::server::{CommonTimeServer, ServerConfig};
use common_time::service::{ClockService, TimelineListener};

struct PrintListener;

impl TimelineListener for PrintListener {
    fn on_timeline_changed(&self, timeline_id: Option<u64>) {
        match timeline_id {
            Some(id) => println!("timeline changed: {id:#018x}"),
            None => println!("timeline lost"),
        }
    }
}

fn main() -> common_time::Result<()> {
    env_logger::init();

    let config = ServerConfig {
        auto_disable: false,
        ..ServerConfig::default()
    };
    let server = CommonTimeServer::new(Arc::new(SystemLocalClock::new()), config)?;
    let clock = ClockService::new(server.clone());

    let listener: Arc<dyn TimelineListener> = Arc::new(PrintListener);
    clock.register_listener(&listener)?;

    server.start()?;
    server.force_networkless_master_mode()?;

    for _ in 0..5 {
        let (valid, timeline) = clock.is_common_time_valid();
        println!(
            "valid: {valid}, timeline: {timeline:?}, common time: {:?} us",
            clock.get_common_time()
        );
        std::thread::sleep(Duration::from_millis(500));
    }

    server.shutdown();
    Ok(())
}
