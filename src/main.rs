//! Headless bridge entry point: scan for the diffuser, connect to the
//! first match, deliver the configuration given on the command line, then
//! disconnect. Session events are printed to stdout as JSON lines so a UI
//! shell can render them.

use std::env;

use anyhow::{bail, Context, Result};
use log::info;

use aroma_bridge::{
    BluestAdapter, ConfigPayload, SessionConfig, SessionController, SessionEvent, SessionState,
};

#[tokio::main]
async fn main() -> Result<()> {
    aroma_bridge::setup_logging();

    let usage = "usage: aroma-bridge <intensity 0-100> <interval 5-120>";
    let mut args = env::args().skip(1);
    let intensity: u8 = args.next().context(usage)?.parse().context(usage)?;
    let interval: u8 = args.next().context(usage)?.parse().context(usage)?;
    // Out-of-range values are rejected here, before the radio is touched.
    let payload = ConfigPayload::new(intensity, interval)?;

    let (adapter, adapter_events) = BluestAdapter::new().await?;
    let (session, mut events) =
        SessionController::spawn(adapter, adapter_events, SessionConfig::default());

    session.start_scan()?;

    let mut selected = false;
    let mut delivered = false;
    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        match &event {
            SessionEvent::DeviceDiscovered(device) if !selected => {
                selected = true;
                info!(
                    "Selecting {} ({})",
                    device.name.as_deref().unwrap_or("unknown"),
                    device.id
                );
                session.select_device(device.id.clone())?;
            }
            SessionEvent::ScanComplete if !selected => {
                bail!("no diffuser found within the scan window");
            }
            SessionEvent::StateChanged(SessionState::Ready) if !delivered => {
                session.send_config(payload.intensity(), payload.interval())?;
            }
            SessionEvent::ConfigDelivered => {
                delivered = true;
                session.disconnect()?;
            }
            SessionEvent::ConfigFailed { reason } => {
                bail!("configuration delivery failed: {}", reason);
            }
            SessionEvent::StateChanged(SessionState::Idle) if delivered => break,
            SessionEvent::StateChanged(SessionState::Failed(reason)) => {
                bail!("session failed: {}", reason);
            }
            _ => {}
        }
    }

    session.shutdown()?;
    Ok(())
}
