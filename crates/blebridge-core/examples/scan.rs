//! Example: what the bridge hears
//!
//! Scans once, classifies every advertisement and decodes the beacons it
//! can, without registering or connecting to anything.
//!
//! Run with: `cargo run --example scan`

use std::time::Duration;

use blebridge_core::{BleHost, BtleplugHost, classify};
use blebridge_types::decode::decode_beacon;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Scanning for 10 seconds...");
    let host = BtleplugHost::new().await?;
    let heard = host.scan(Duration::from_secs(10)).await?;

    for adv in &heard {
        let class = classify(adv);
        println!(
            "{}  {:<22} {}",
            adv.address,
            adv.name.as_deref().unwrap_or("-"),
            class.family
        );
        match class.beacon.map(|b| decode_beacon(class.family, b)) {
            Some(Ok(reading)) => {
                for metric in reading.metrics() {
                    println!("    {}: {} {}", metric.name, metric.value, metric.unit);
                }
            }
            Some(Err(e)) => println!("    beacon not decoded: {e}"),
            None => {}
        }
    }
    println!("{} advertisements", heard.len());
    Ok(())
}
