//! Transitive dependency closure over a `UnitResolver`.

use std::collections::HashSet;

use crate::error::ResolveError;
use crate::unit::{BuildParams, ResolvedUnit, UnitId, UnitResolver, NATIVE_INTEROP_UNIT};

/// One member of a closure.
#[derive(Debug, Clone)]
pub struct CollectedUnit {
    pub id: UnitId,
    pub unit: ResolvedUnit,
}

pub struct DependencyCollector<'a, R: ?Sized> {
    resolver: &'a R,
    params: &'a BuildParams,
}

impl<'a, R: UnitResolver + ?Sized> DependencyCollector<'a, R> {
    pub fn new(resolver: &'a R, params: &'a BuildParams) -> Self {
        Self { resolver, params }
    }

    /// Collect every non-standard unit reachable from `root`, root first.
    ///
    /// Only the root carries `include_tests`; its imports (test imports
    /// included) are visited without tests. Any resolution failure aborts the
    /// whole closure.
    pub fn collect(&self, root: &UnitId) -> Result<Vec<CollectedUnit>, ResolveError> {
        let mut visited: HashSet<UnitId> = HashSet::new();
        let mut closure = Vec::new();
        let mut stack = vec![root.clone()];

        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }

            let unit = self.resolver.resolve(&id, self.params)?;
            if unit.is_standard_library {
                tracing::trace!("Skipping standard unit {}", id.name);
                continue;
            }

            // Reverse so the first import is visited first.
            for import in unit.imports.iter().rev() {
                if import == NATIVE_INTEROP_UNIT || *import == id.name {
                    continue;
                }
                let dep = UnitId::new(import.clone());
                if !visited.contains(&dep) {
                    stack.push(dep);
                }
            }

            closure.push(CollectedUnit { id, unit });
        }

        Ok(closure)
    }
}
