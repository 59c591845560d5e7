//! Multi-hop route planning across transporters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::lab::Lab;

/// One transporter hop between two taught positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStep {
    pub source: String,
    pub target: String,
    pub transporter: String,
}

/// Hops that chain from a source location to a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Route {
    pub steps: Vec<RouteStep>,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("(no movement)");
        }
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} -> {} via {}", step.source, step.target, step.transporter)?;
        }
        Ok(())
    }
}

/// Plans routes over the lab's transporters.
///
/// Locations are nodes and each transporter connects every pair of lab
/// locations it is taught. Search is breadth-first, so a single-hop route is
/// returned whenever one exists. Ties go to the earlier-registered
/// transporter, then to the earlier taught position.
#[derive(Debug, Clone)]
pub struct Router {
    lab: Arc<Lab>,
}

impl Router {
    pub fn new(lab: Arc<Lab>) -> Self {
        Self { lab }
    }

    pub fn route(&self, from: &str, to: &str) -> Result<Route> {
        self.lab.location(from)?;
        self.lab.location(to)?;
        if from == to {
            return Ok(Route::default());
        }

        let transporters: Vec<(String, Vec<String>)> = self
            .lab
            .transporters()
            .iter()
            .map(|t| (t.name().to_string(), t.taught_positions()))
            .collect();

        // node -> (previous node, transporter index)
        let mut parent: HashMap<String, (String, usize)> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);
        parent.insert(from.to_string(), (String::new(), usize::MAX));

        'search: while let Some(node) = queue.pop_front() {
            for (index, (_, taught)) in transporters.iter().enumerate() {
                if !taught.iter().any(|p| *p == node) {
                    continue;
                }
                for next in taught {
                    if parent.contains_key(next) || self.lab.location(next).is_err() {
                        continue;
                    }
                    parent.insert(next.clone(), (node.clone(), index));
                    if next == to {
                        break 'search;
                    }
                    queue.push_back(next.clone());
                }
            }
        }

        if !parent.contains_key(to) {
            return Err(EngineError::NoRouteFound {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut steps = Vec::new();
        let mut current = to.to_string();
        while current != from {
            let Some((previous, index)) = parent.get(&current).cloned() else {
                break;
            };
            let transporter = transporters
                .get(index)
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            steps.push(RouteStep {
                source: previous.clone(),
                target: current,
                transporter,
            });
            current = previous;
        }
        steps.reverse();
        tracing::debug!(from = %from, to = %to, hops = steps.len(), "route planned");
        Ok(Route { steps })
    }
}
