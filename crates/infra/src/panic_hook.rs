//! Process panic hook that reports to the supervisor bus.

use sensor_ingest_ports::{SupervisorBusPort, SupervisorEvent};
use std::panic::PanicHookInfo;
use std::sync::Arc;

/// Install a hook that publishes every panic as [`SupervisorEvent::Exception`].
///
/// The previously installed hook still runs afterwards, so the default
/// stderr report is kept.
pub fn install_panic_hook(bus: Arc<dyn SupervisorBusPort>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        bus.publish(exception_event(info));
        previous(info);
    }));
}

/// Restore the default panic hook.
pub fn reset_panic_hook() {
    drop(std::panic::take_hook());
}

fn exception_event(info: &PanicHookInfo<'_>) -> SupervisorEvent {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_owned());
    let location = info
        .location()
        .map(|location| format!("{}:{}:{}", location.file(), location.line(), location.column()));
    SupervisorEvent::Exception {
        message: message.into(),
        location: location.map(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_ingest_adapters::BroadcastSupervisorBus;

    #[allow(clippy::panic, reason = "the hook under test needs a real panic")]
    fn sensor_fault() {
        panic!("sensor fault");
    }

    #[tokio::test]
    async fn panics_in_tasks_are_published() -> Result<(), Box<dyn std::error::Error>> {
        let bus: Arc<dyn SupervisorBusPort> = Arc::new(BroadcastSupervisorBus::default());
        let mut events = bus.subscribe();
        install_panic_hook(Arc::clone(&bus));

        let joined = tokio::spawn(async { sensor_fault() }).await;
        reset_panic_hook();
        assert!(joined.is_err());

        let event = events.next_event().await.ok_or("bus closed")?;
        let SupervisorEvent::Exception { message, location } = event else {
            return Err(format!("unexpected event {event:?}").into());
        };
        assert_eq!(&*message, "sensor fault");
        assert!(location.is_some_and(|location| location.contains("panic_hook.rs")));
        Ok(())
    }
}
