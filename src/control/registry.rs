use std::collections::HashMap;

use log::debug;

use crate::error::ConfigurationError;

use super::ControlPoint;

/// Lookup table of control points by id.
///
/// Filled while a site is configured; only read once sessions are active.
#[derive(Debug, Default, Clone)]
pub struct ControlPointRegistry {
    points: HashMap<String, ControlPoint>,
}

impl ControlPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, point: ControlPoint) -> Result<(), ConfigurationError> {
        if self.points.contains_key(point.id()) {
            return Err(ConfigurationError::DuplicateControlPoint(
                point.id().to_string(),
            ));
        }
        debug!(
            "registered control point '{}' (dof {}, {})",
            point.id(),
            point.dof_index(),
            point.kind()
        );
        self.points.insert(point.id().to_string(), point);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ControlPoint> {
        self.points.get(id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns the points named by `ids`, in the order given.
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<ControlPoint>, ConfigurationError> {
        ids.iter()
            .map(|id| {
                self.points
                    .get(id.as_ref())
                    .cloned()
                    .ok_or_else(|| ConfigurationError::UnknownControlPoint(id.as_ref().to_string()))
            })
            .collect()
    }
}

impl TryFrom<Vec<ControlPoint>> for ControlPointRegistry {
    type Error = ConfigurationError;

    fn try_from(value: Vec<ControlPoint>) -> Result<Self, Self::Error> {
        let mut registry = ControlPointRegistry::new();
        for point in value {
            registry.register(point)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use crate::control::ResponseKind;

    use super::*;

    fn registry() -> ControlPointRegistry {
        vec![
            ControlPoint::new("disp", 0, ResponseKind::Displacement),
            ControlPoint::new("force", 0, ResponseKind::Force),
            ControlPoint::new("vel", 1, ResponseKind::Velocity),
        ]
        .try_into()
        .unwrap()
    }

    #[test]
    fn resolve_keeps_requested_order() {
        let points = registry().resolve(&["vel", "disp"]).unwrap();
        let ids: Vec<&str> = points.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["vel", "disp"]);
    }

    #[test]
    #[should_panic(expected = "UnknownControlPoint(\"missing\")")]
    fn resolve_unknown_id() {
        registry().resolve(&["disp", "missing"]).unwrap();
    }

    #[test]
    #[should_panic(expected = "DuplicateControlPoint")]
    fn duplicate_ids_rejected() {
        let mut registry = registry();
        registry
            .register(ControlPoint::new("disp", 3, ResponseKind::Displacement))
            .unwrap();
    }
}
