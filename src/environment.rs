//! Target environment description.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// The target environment an asset is built for.
///
/// Opaque to the engine except that it participates in asset ids and
/// cache keys. Shared by reference with child assets and dependencies,
/// never mutated after a request starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Context tag, e.g. `browser` or `node`.
    pub context: String,
    /// Engine version requirements, keyed by engine name.
    pub engines: BTreeMap<String, String>,
    /// Whether the build targets a library rather than an application.
    pub is_library: bool,
}

impl Environment {
    pub fn browser(versions: &str) -> Self {
        Self {
            context: "browser".into(),
            engines: BTreeMap::from([("browsers".to_owned(), versions.to_owned())]),
            is_library: false,
        }
    }
}

impl Hash for Environment {
    // Fields are fed in a fixed order so cache keys stay stable across
    // restarts.
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(self.context.as_bytes());
        for (engine, version) in &self.engines {
            state.write(engine.as_bytes());
            state.write(version.as_bytes());
        }
        state.write_u8(self.is_library as u8);
    }
}
