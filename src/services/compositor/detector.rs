//! Compositor detection.
//!
//! Candidates are tried in a fixed order: River, then Hyprland. The first one
//! that connects and reports itself available wins. Detection happens once at
//! startup; a compositor that comes up later is not picked up.

use super::{Compositor, hyprland::HyprlandAdapter, river::RiverAdapter};
use log::{info, warn};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error(
        "no supported compositor detected (tried: {}); make sure River or Hyprland is running",
        .tried.join(", ")
    )]
    NoCompositor { tried: Vec<&'static str> },
}

/// Which backends detection may consider.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompositorChoice {
    #[default]
    Auto,
    River,
    Hyprland,
}

pub trait Probe {
    fn is_available(&self) -> bool;
}

impl Probe for Compositor {
    fn is_available(&self) -> bool {
        Compositor::is_available(self)
    }
}

type Connect<A> = Box<dyn FnOnce() -> anyhow::Result<A>>;

pub struct Candidate<A> {
    pub name: &'static str,
    connect: Connect<A>,
}

impl<A> Candidate<A> {
    pub fn new(name: &'static str, connect: impl FnOnce() -> anyhow::Result<A> + 'static) -> Self {
        Self {
            name,
            connect: Box::new(connect),
        }
    }
}

impl CompositorChoice {
    pub fn candidates(self) -> Vec<Candidate<Compositor>> {
        let river = || {
            Candidate::new(super::river::NAME, || {
                RiverAdapter::new().map(Compositor::River)
            })
        };
        let hyprland = || {
            Candidate::new(super::hyprland::NAME, || {
                HyprlandAdapter::new().map(Compositor::Hyprland)
            })
        };

        match self {
            CompositorChoice::Auto => vec![river(), hyprland()],
            CompositorChoice::River => vec![river()],
            CompositorChoice::Hyprland => vec![hyprland()],
        }
    }
}

pub fn detect(choice: CompositorChoice) -> Result<Compositor, DetectError> {
    detect_from(choice.candidates())
}

/// Returns the first candidate that both connects and is available.
pub fn detect_from<A: Probe>(candidates: Vec<Candidate<A>>) -> Result<A, DetectError> {
    let mut tried = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        tried.push(candidate.name);

        match (candidate.connect)() {
            Ok(adapter) if adapter.is_available() => {
                info!("Detected compositor: {}", candidate.name);
                return Ok(adapter);
            }
            Ok(_) => {
                info!("{} connected but is not available", candidate.name);
            }
            Err(e) => {
                warn!("Failed to initialize {} adapter: {e:#}", candidate.name);
            }
        }
    }

    Err(DetectError::NoCompositor { tried })
}
