//! One UI surface per compositor monitor.
//!
//! Each monitor name is either absent from the map, `Live` with a surface and
//! the scope holding every subscription made while building it, or
//! `Disposing` while the surface waits for its deferred release. The entry is
//! only removed once that release has run, so a second removal for the same
//! monitor hits `Disposing` and does nothing.

use crate::{
    config,
    reactive::{Scheduler, Scope},
    services::compositor::{
        CompositorService, Monitor, ToolkitMonitor, match_monitor, matcher::is_exact_match,
    },
};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

/// The toolkit's own view of the connected monitors.
pub trait MonitorRegistry {
    type Handle: ToolkitMonitor + Clone + 'static;

    fn monitors(&self) -> Vec<Self::Handle>;
}

pub trait UiSurface {
    fn hide(&mut self);
    fn destroy(self);
}

pub type SurfaceBuilder<H, S> = Box<dyn Fn(&Monitor, &H, &mut Scope) -> Result<S>>;

enum Entry<S> {
    Live {
        surface: S,
        scope: Scope,
        connector: Option<String>,
    },
    Disposing {
        reattach: Option<Monitor>,
    },
}

struct Inner<R: MonitorRegistry, S> {
    registry: R,
    build: SurfaceBuilder<R::Handle, S>,
    scheduler: Rc<dyn Scheduler>,
    filter: config::Outputs,
    entries: RefCell<HashMap<String, Entry<S>>>,
    closing: Cell<bool>,
}

pub struct Outputs<R: MonitorRegistry, S>(Rc<Inner<R, S>>);

impl<R: MonitorRegistry, S> Clone for Outputs<R, S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<R, S> Outputs<R, S>
where
    R: MonitorRegistry + 'static,
    S: UiSurface + 'static,
{
    pub fn new(
        registry: R,
        build: SurfaceBuilder<R::Handle, S>,
        scheduler: Rc<dyn Scheduler>,
        filter: config::Outputs,
    ) -> Self {
        Self(Rc::new(Inner {
            registry,
            build,
            scheduler,
            filter,
            entries: RefCell::new(HashMap::new()),
            closing: Cell::new(false),
        }))
    }

    /// Attaches every monitor the compositor already reports and follows its
    /// added/removed notifications for as long as the returned scope lives.
    pub fn start(&self, service: &CompositorService) -> Scope {
        for monitor in service.monitors().get() {
            self.attach(&monitor);
        }

        let mut scope = Scope::new();
        let weak = Rc::downgrade(&self.0);
        scope.add(service.monitor_added().connect({
            let weak = weak.clone();
            move |monitor| {
                if let Some(inner) = weak.upgrade() {
                    Outputs(inner).attach(monitor);
                }
            }
        }));
        scope.add(service.monitor_removed().connect(move |name| {
            if let Some(inner) = weak.upgrade() {
                Outputs(inner).detach(name);
            }
        }));

        scope
    }

    pub fn attach(&self, monitor: &Monitor) {
        if self.0.closing.get() {
            debug!("Shutting down, not attaching monitor {}", monitor.name);
            return;
        }
        if !self.0.filter.allows(&monitor.name) {
            debug!("Monitor {} is not targeted, skipping", monitor.name);
            return;
        }

        match self.0.entries.borrow_mut().get_mut(&monitor.name) {
            Some(Entry::Live { .. }) => {
                debug!("Monitor {} already has a surface", monitor.name);
                return;
            }
            Some(Entry::Disposing { reattach }) => {
                debug!(
                    "Monitor {} is still being torn down, attaching after release",
                    monitor.name
                );
                *reattach = Some(monitor.clone());
                return;
            }
            None => {}
        }

        let Some(handle) = match_monitor(monitor, &self.0.registry.monitors()) else {
            warn!(
                "No toolkit monitor for {} yet, waiting for the toolkit",
                monitor.name
            );
            return;
        };

        let mut scope = Scope::new();
        match (self.0.build)(monitor, &handle, &mut scope) {
            Ok(surface) => {
                info!("Surface created for monitor {}", monitor.name);
                self.0.entries.borrow_mut().insert(
                    monitor.name.clone(),
                    Entry::Live {
                        surface,
                        scope,
                        connector: handle.connector(),
                    },
                );
            }
            Err(e) => {
                scope.dispose();
                error!("Failed to create surface for monitor {}: {e:#}", monitor.name);
            }
        }
    }

    pub fn detach(&self, name: &str) {
        let live = {
            let mut entries = self.0.entries.borrow_mut();
            match entries.get_mut(name) {
                None => {
                    warn!("Monitor {name} has no surface to remove");
                    return;
                }
                Some(Entry::Disposing { reattach }) => {
                    debug!("Monitor {name} is already being torn down");
                    *reattach = None;
                    return;
                }
                Some(Entry::Live { .. }) => {}
            }
            entries.insert(name.to_owned(), Entry::Disposing { reattach: None })
        };

        let Some(Entry::Live {
            mut surface,
            mut scope,
            ..
        }) = live
        else {
            return;
        };

        scope.dispose();
        surface.hide();

        let weak = Rc::downgrade(&self.0);
        let name = name.to_owned();
        self.0.scheduler.defer(Box::new(move || {
            surface.destroy();
            if let Some(inner) = weak.upgrade() {
                Outputs(inner).release(&name);
            }
        }));
    }

    fn release(&self, name: &str) {
        let reattach = match self.0.entries.borrow_mut().remove(name) {
            Some(Entry::Disposing { reattach }) => reattach,
            _ => None,
        };
        debug!("Surface for monitor {name} released");

        if let Some(monitor) = reattach {
            self.attach(&monitor);
        }
    }

    /// Re-resolves `monitors` after the toolkit's monitor set changed.
    ///
    /// Monitors without a surface are attached, and surfaces that were bound to
    /// another connector by fallback are rebuilt once their own connector shows
    /// up.
    pub fn sync(&self, monitors: &[Monitor]) {
        let handles = self.0.registry.monitors();

        for monitor in monitors {
            let rebind = match self.0.entries.borrow().get(&monitor.name) {
                None => false,
                Some(Entry::Disposing { .. }) => continue,
                Some(Entry::Live { connector, .. }) => {
                    connector.as_deref() != Some(monitor.name.as_str())
                        && handles.iter().any(|h| is_exact_match(monitor, h))
                }
            };

            if rebind {
                info!("Monitor {} is now known to the toolkit, rebuilding", monitor.name);
                self.detach(&monitor.name);
            }
            self.attach(monitor);
        }
    }

    /// Tears down every surface through the regular path. Queued re-attaches
    /// are dropped and later attaches are ignored.
    pub fn detach_all(&self) {
        self.0.closing.set(true);
        for entry in self.0.entries.borrow_mut().values_mut() {
            if let Entry::Disposing { reattach } = entry {
                *reattach = None;
            }
        }
        for name in self.live_names() {
            self.detach(&name);
        }
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names = self
            .0
            .entries
            .borrow()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Live { .. }))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        names.sort();

        names
    }

    /// Whether any surface is live or still waiting for its release.
    pub fn has_entries(&self) -> bool {
        !self.0.entries.borrow().is_empty()
    }
}

#[cfg(test)]
impl<R, S> Outputs<R, S>
where
    R: MonitorRegistry + 'static,
    S: UiSurface + 'static,
{
    fn is_live(&self, name: &str) -> bool {
        matches!(self.0.entries.borrow().get(name), Some(Entry::Live { .. }))
    }

    fn is_disposing(&self, name: &str) -> bool {
        matches!(
            self.0.entries.borrow().get(name),
            Some(Entry::Disposing { .. })
        )
    }

    fn contains(&self, name: &str) -> bool {
        self.0.entries.borrow().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reactive::{Live, ManualTick},
        services::compositor::CompositorState,
    };
    use anyhow::bail;

    #[derive(Debug, Clone, PartialEq)]
    struct Handle(&'static str);

    impl ToolkitMonitor for Handle {
        fn connector(&self) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    #[derive(Clone, Default)]
    struct Registry(Rc<RefCell<Vec<Handle>>>);

    impl Registry {
        fn with(connectors: &[&'static str]) -> Self {
            Self(Rc::new(RefCell::new(
                connectors.iter().copied().map(Handle).collect(),
            )))
        }

        fn push(&self, connector: &'static str) {
            self.0.borrow_mut().push(Handle(connector));
        }
    }

    impl MonitorRegistry for Registry {
        type Handle = Handle;

        fn monitors(&self) -> Vec<Handle> {
            self.0.borrow().clone()
        }
    }

    type Log = Rc<RefCell<Vec<String>>>;

    struct Surface {
        id: usize,
        log: Log,
    }

    impl UiSurface for Surface {
        fn hide(&mut self) {
            self.log.borrow_mut().push(format!("hide #{}", self.id));
        }

        fn destroy(self) {
            self.log.borrow_mut().push(format!("destroy #{}", self.id));
        }
    }

    struct Harness {
        outputs: Outputs<Registry, Surface>,
        registry: Registry,
        tick: Rc<ManualTick>,
        log: Log,
        source: Live<u32>,
        built: Rc<RefCell<Vec<(usize, String, Handle)>>>,
    }

    impl Harness {
        fn new(connectors: &[&'static str], filter: config::Outputs) -> Self {
            Self::failing_on(connectors, filter, "")
        }

        fn failing_on(
            connectors: &[&'static str],
            filter: config::Outputs,
            broken: &'static str,
        ) -> Self {
            let registry = Registry::with(connectors);
            let tick = Rc::new(ManualTick::default());
            let log = Log::default();
            let source = Live::new(0);
            let built = Rc::new(RefCell::new(Vec::new()));
            let next_id = Rc::new(Cell::new(0));

            let build: SurfaceBuilder<Handle, Surface> = Box::new({
                let log = log.clone();
                let accessor = source.accessor();
                let built = built.clone();
                move |monitor: &Monitor, handle: &Handle, scope: &mut Scope| {
                    // subscribe before failing so a failed build has something to release
                    scope.add(accessor.subscribe(|_| {}));
                    if monitor.name == broken {
                        bail!("no layer shell");
                    }

                    next_id.set(next_id.get() + 1);
                    let id = next_id.get();
                    log.borrow_mut().push(format!("build #{id} {}", monitor.name));
                    built
                        .borrow_mut()
                        .push((id, monitor.name.clone(), handle.clone()));

                    Ok(Surface {
                        id,
                        log: log.clone(),
                    })
                }
            });

            Self {
                outputs: Outputs::new(registry.clone(), build, tick.clone(), filter),
                registry,
                tick,
                log,
                source,
                built,
            }
        }

        fn destroys(&self) -> usize {
            self.log
                .borrow()
                .iter()
                .filter(|line| line.starts_with("destroy"))
                .count()
        }

        fn subscriptions(&self) -> usize {
            self.source.accessor().subscriber_count()
        }
    }

    fn monitor(name: &str) -> Monitor {
        Monitor {
            name: name.to_owned(),
            width: 1920,
            height: 1080,
            x: 0,
            y: 0,
            scale: 1.0,
            focused: false,
        }
    }

    #[test]
    fn attach_then_detach_releases_everything_once() {
        let h = Harness::new(&["DP-1"], config::Outputs::All);

        h.outputs.attach(&monitor("DP-1"));
        assert!(h.outputs.is_live("DP-1"));
        assert_eq!(h.subscriptions(), 1);

        h.outputs.detach("DP-1");
        assert_eq!(h.subscriptions(), 0);
        assert!(h.outputs.is_disposing("DP-1"));
        assert_eq!(*h.log.borrow(), vec!["build #1 DP-1", "hide #1"]);

        assert_eq!(h.tick.run_pending(), 1);
        assert!(!h.outputs.contains("DP-1"));
        assert_eq!(
            *h.log.borrow(),
            vec!["build #1 DP-1", "hide #1", "destroy #1"]
        );
    }

    #[test]
    fn repeated_detach_without_surface_destroys_nothing() {
        let h = Harness::new(&["DP-1"], config::Outputs::All);

        for _ in 0..5 {
            h.outputs.detach("DP-1");
        }
        assert_eq!(h.tick.pending(), 0);
        assert_eq!(h.destroys(), 0);

        h.outputs.attach(&monitor("DP-1"));
        for _ in 0..5 {
            h.outputs.detach("DP-1");
        }
        assert_eq!(h.tick.pending(), 1);
        h.tick.run_pending();
        assert_eq!(h.destroys(), 1);
    }

    #[test]
    fn monitors_come_and_go() {
        let h = Harness::new(&["HDMI-1", "DP-1"], config::Outputs::All);

        h.outputs.attach(&monitor("DP-1"));
        h.outputs.attach(&monitor("HDMI-1"));
        assert_eq!(h.outputs.live_names(), vec!["DP-1", "HDMI-1"]);
        assert_eq!(
            *h.built.borrow(),
            vec![
                (1, "DP-1".to_owned(), Handle("DP-1")),
                (2, "HDMI-1".to_owned(), Handle("HDMI-1"))
            ]
        );

        h.outputs.detach("DP-1");
        h.tick.run_pending();
        assert_eq!(h.outputs.live_names(), vec!["HDMI-1"]);

        h.outputs.attach(&monitor("DP-1"));
        assert_eq!(h.outputs.live_names(), vec!["DP-1", "HDMI-1"]);
        let built = h.built.borrow();
        let (id, name, handle) = built.last().unwrap();
        assert_eq!(*id, 3);
        assert_eq!(name, "DP-1");
        assert_eq!(*handle, Handle("DP-1"));
        assert_eq!(h.destroys(), 1);
    }

    #[test]
    fn failed_build_leaves_no_entry() {
        let h = Harness::failing_on(&["DP-1", "HDMI-1"], config::Outputs::All, "HDMI-1");

        h.outputs.attach(&monitor("HDMI-1"));

        assert!(!h.outputs.contains("HDMI-1"));
        assert_eq!(h.subscriptions(), 0);

        h.outputs.detach("HDMI-1");
        assert_eq!(h.tick.pending(), 0);
    }

    #[test]
    fn no_toolkit_monitor_means_no_surface() {
        let h = Harness::new(&[], config::Outputs::All);

        h.outputs.attach(&monitor("DP-1"));

        assert!(!h.outputs.contains("DP-1"));
        assert!(h.built.borrow().is_empty());
    }

    #[test]
    fn attach_during_teardown_waits_for_release() {
        let h = Harness::new(&["DP-1"], config::Outputs::All);

        h.outputs.attach(&monitor("DP-1"));
        h.outputs.detach("DP-1");
        h.outputs.attach(&monitor("DP-1"));

        assert!(h.outputs.is_disposing("DP-1"));
        assert_eq!(h.built.borrow().len(), 1);

        h.tick.run_pending();

        assert!(h.outputs.is_live("DP-1"));
        assert_eq!(
            *h.log.borrow(),
            vec!["build #1 DP-1", "hide #1", "destroy #1", "build #2 DP-1"]
        );
    }

    #[test]
    fn attach_then_detach_during_teardown_ends_absent() {
        let h = Harness::new(&["DP-1"], config::Outputs::All);

        h.outputs.attach(&monitor("DP-1"));
        h.outputs.detach("DP-1");
        h.outputs.attach(&monitor("DP-1"));
        h.outputs.detach("DP-1");
        h.tick.run_pending();

        assert!(!h.outputs.contains("DP-1"));
        assert_eq!(h.built.borrow().len(), 1);
        assert_eq!(h.destroys(), 1);
    }

    #[test]
    fn sync_attaches_monitors_the_toolkit_learned_late() {
        let h = Harness::new(&[], config::Outputs::All);
        let monitors = vec![monitor("DP-1")];

        h.outputs.attach(&monitors[0]);
        assert!(!h.outputs.contains("DP-1"));

        h.registry.push("DP-1");
        h.outputs.sync(&monitors);

        assert!(h.outputs.is_live("DP-1"));
        assert_eq!(h.built.borrow()[0].2, Handle("DP-1"));
    }

    #[test]
    fn sync_rebuilds_fallback_bindings() {
        let h = Harness::new(&["eDP-1"], config::Outputs::All);
        let monitors = vec![monitor("DP-1")];

        h.outputs.attach(&monitors[0]);
        assert_eq!(h.built.borrow()[0].2, Handle("eDP-1"));

        // nothing better yet
        h.outputs.sync(&monitors);
        assert_eq!(h.tick.pending(), 0);

        h.registry.push("DP-1");
        h.outputs.sync(&monitors);
        assert!(h.outputs.is_disposing("DP-1"));

        h.tick.run_pending();
        assert!(h.outputs.is_live("DP-1"));
        assert_eq!(h.built.borrow()[1].2, Handle("DP-1"));
        assert_eq!(h.destroys(), 1);
    }

    #[test]
    fn untargeted_monitors_are_skipped() {
        let h = Harness::new(
            &["DP-1", "HDMI-1"],
            config::Outputs::Targets {
                targets: vec!["HDMI-1".into()],
            },
        );

        h.outputs.attach(&monitor("DP-1"));
        h.outputs.attach(&monitor("HDMI-1"));

        assert_eq!(h.outputs.live_names(), vec!["HDMI-1"]);
    }

    #[test]
    fn follows_compositor_notifications() {
        let h = Harness::new(&["DP-1", "HDMI-1"], config::Outputs::All);
        let service = CompositorService::new(CompositorState {
            monitors: vec![monitor("DP-1")],
            ..Default::default()
        });

        let scope = h.outputs.start(&service);
        assert_eq!(h.outputs.live_names(), vec!["DP-1"]);

        service.update(CompositorState {
            monitors: vec![monitor("HDMI-1")],
            ..Default::default()
        });
        assert_eq!(h.outputs.live_names(), vec!["HDMI-1"]);
        assert!(h.outputs.is_disposing("DP-1"));

        h.tick.run_pending();
        drop(scope);
        service.update(CompositorState::default());
        assert_eq!(h.outputs.live_names(), vec!["HDMI-1"]);
    }

    #[test]
    fn detach_all_tears_down_every_surface() {
        let h = Harness::new(&["DP-1", "HDMI-1"], config::Outputs::All);
        h.outputs.attach(&monitor("DP-1"));
        h.outputs.attach(&monitor("HDMI-1"));

        h.outputs.detach_all();
        h.tick.run_pending();

        assert!(h.outputs.live_names().is_empty());
        assert_eq!(h.destroys(), 2);
        assert_eq!(h.subscriptions(), 0);
    }

    #[test]
    fn detach_all_drops_a_queued_reattach() {
        let h = Harness::new(&["DP-1"], config::Outputs::All);
        h.outputs.attach(&monitor("DP-1"));
        h.outputs.detach("DP-1");
        h.outputs.attach(&monitor("DP-1"));
        assert!(h.outputs.is_disposing("DP-1"));

        h.outputs.detach_all();
        h.tick.run_pending();

        assert!(!h.outputs.has_entries());
        assert_eq!(h.destroys(), 1);

        h.outputs.attach(&monitor("DP-1"));
        assert!(!h.outputs.has_entries());
    }
}
