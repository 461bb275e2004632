//! Three simulated tabs sharing one in-memory store.
//!
//! Run with `RUST_LOG=debug` to watch the election, the renewal and the
//! cross-tab sign-out.

use std::sync::Arc;
use std::time::Duration;

use tabsync_core::{
    init_logging, Clock, Config, Coordinator, Credentials, MemoryProvider, Result, SharedStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let clock = Clock::new();
    let store = SharedStore::open_in_memory()?;
    let provider = Arc::new(MemoryProvider::new(clock, chrono::Duration::seconds(20)));
    provider.add_account("demo@example.com", "demo");

    let config = Config {
        domain: "demo".to_string(),
        refresh_threshold: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(500),
        leader_timeout: Duration::from_secs(2),
        ..Config::default()
    };

    let mut tabs = Vec::new();
    for name in ["tab-a", "tab-b", "tab-c"] {
        let tab = Coordinator::builder(provider.clone(), store.clone())
            .config(config.clone())
            .clock(clock)
            .tab_id(name)
            .build()?;
        tab.initialize().await?;
        tabs.push(tab);
    }

    tabs[0]
        .sign_in(&Credentials::new("demo@example.com", "demo"))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    report(&tabs);

    // Past the first renewal
    tokio::time::sleep(Duration::from_secs(16)).await;
    println!("renewals so far: {}", provider.renewals().len());

    tabs[0].destroy();
    tokio::time::sleep(Duration::from_millis(200)).await;
    report(&tabs[1..]);

    tabs[2].sign_out().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    report(&tabs[1..]);

    for tab in &tabs[1..] {
        tab.destroy();
    }
    Ok(())
}

fn report(tabs: &[Coordinator]) {
    for tab in tabs {
        let state = tab.state();
        println!(
            "{:<6} {:<16} leader={} user={}",
            tab.tab_id(),
            state.status.as_str(),
            tab.is_leader(),
            state
                .user
                .as_ref()
                .and_then(|user| user.email.as_deref())
                .unwrap_or("-")
        );
    }
}
