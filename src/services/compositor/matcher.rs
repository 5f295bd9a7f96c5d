use super::Monitor;
use log::debug;

/// A monitor handle as seen by the windowing toolkit.
pub trait ToolkitMonitor {
    /// Connector name (`DP-1`, `HDMI-A-1`, ...) if the toolkit knows it yet.
    fn connector(&self) -> Option<String>;
}

pub fn is_exact_match<M: ToolkitMonitor>(monitor: &Monitor, candidate: &M) -> bool {
    candidate.connector().as_deref() == Some(monitor.name.as_str())
}

/// Finds the toolkit handle whose connector is `monitor.name`.
///
/// The compositor and the toolkit announce outputs independently, so the
/// toolkit may not know a fresh output yet. In that case the first toolkit
/// monitor is returned; `None` only when the toolkit knows no monitor at all.
pub fn match_monitor<M: ToolkitMonitor + Clone>(monitor: &Monitor, candidates: &[M]) -> Option<M> {
    if let Some(exact) = candidates.iter().find(|c| is_exact_match(monitor, *c)) {
        return Some(exact.clone());
    }

    let fallback = candidates.first().cloned();
    debug!(
        "No toolkit monitor with connector {}, falling back to the first of {}",
        monitor.name,
        candidates.len()
    );

    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Handle(u32, Option<&'static str>);

    impl ToolkitMonitor for Handle {
        fn connector(&self) -> Option<String> {
            self.1.map(str::to_owned)
        }
    }

    fn monitor(name: &str) -> Monitor {
        Monitor {
            name: name.to_owned(),
            width: 2560,
            height: 1440,
            x: 0,
            y: 0,
            scale: 1.0,
            focused: true,
        }
    }

    #[test]
    fn exact_match_regardless_of_order() {
        let handles = vec![
            Handle(1, Some("HDMI-1")),
            Handle(2, None),
            Handle(3, Some("DP-1")),
        ];

        assert_eq!(
            match_monitor(&monitor("DP-1"), &handles),
            Some(Handle(3, Some("DP-1")))
        );

        let reversed = handles.into_iter().rev().collect::<Vec<_>>();
        assert_eq!(
            match_monitor(&monitor("DP-1"), &reversed),
            Some(Handle(3, Some("DP-1")))
        );
        assert_eq!(
            match_monitor(&monitor("HDMI-1"), &reversed),
            Some(Handle(1, Some("HDMI-1")))
        );
    }

    #[test]
    fn falls_back_to_first_enumerated() {
        let handles = vec![Handle(7, Some("eDP-1")), Handle(8, Some("HDMI-1"))];

        assert_eq!(
            match_monitor(&monitor("DP-3"), &handles),
            Some(Handle(7, Some("eDP-1")))
        );
    }

    #[test]
    fn none_only_without_toolkit_monitors() {
        assert_eq!(match_monitor::<Handle>(&monitor("DP-1"), &[]), None);
        assert!(match_monitor(&monitor("DP-1"), &[Handle(1, None)]).is_some());
    }
}
