//! Runtime-readable configuration registry.
//!
//! Two layers, read in order: a process-wide [`config::Config`] built
//! once from `FIBRIO__*` environment variables, then a small in-memory
//! override store so a value set programmatically at runtime is
//! visible on the *next* read without rebuilding the environment
//! layer.
//!
//! The environment source splits on a double underscore rather than
//! `config`'s single-underscore default, so a key whose own name
//! contains an underscore (`fiber.stack_size`) doesn't get an extra
//! dot inserted where none belongs.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

static ENV_LAYER: Lazy<config::Config> = Lazy::new(|| {
    config::Config::builder()
        .add_source(config::Environment::with_prefix("FIBRIO").separator("__"))
        .build()
        .unwrap_or_else(|_| config::Config::default())
});

/// A configuration value. The core only ever stores integers, but the
/// enum leaves room for collaborators (HTTP layer, CLI) sharing the
/// same registry to store strings/bools without a second mechanism.
#[derive(Clone, Debug)]
pub enum ConfigValue {
    UInt(u64),
    Str(String),
    Bool(bool),
}

impl ConfigValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt(v) => Some(*v),
            _ => None,
        }
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, ConfigValue>>> = Lazy::new(|| RwLock::new(HashMap::new()));

const FIBER_STACK_SIZE: &str = "fiber.stack_size";
const TCP_CONNECT_TIMEOUT: &str = "tcp.connect.timeout";

const DEFAULT_STACK_SIZE: u64 = 131_072;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Set (or overwrite) a named configuration value. Visible to the next
/// call to a reader, never cached past this point.
pub fn set(key: &str, value: ConfigValue) {
    REGISTRY.write().unwrap().insert(key.to_string(), value);
}

fn read_u64(key: &str, default: u64) -> u64 {
    if let Some(v) = REGISTRY.read().unwrap().get(key).and_then(ConfigValue::as_u64) {
        return v;
    }
    ENV_LAYER.get_int(key).ok().map(|v| v as u64).unwrap_or(default)
}

/// `fiber.stack_size` (env override `FIBRIO__FIBER__STACK_SIZE`) —
/// default coroutine stack, in bytes.
pub fn stack_size() -> usize {
    read_u64(FIBER_STACK_SIZE, DEFAULT_STACK_SIZE) as usize
}

/// `tcp.connect.timeout` (env override `FIBRIO__TCP__CONNECT__TIMEOUT`)
/// — default `connect` timeout (ms) when no per-call value is supplied.
pub fn connect_timeout_ms() -> u64 {
    read_u64(TCP_CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT_MS)
}
