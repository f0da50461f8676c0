use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::RenderNodeStatus;
use super::ids::{CommandId, NodeId, PoolId, PoolShareId, RenderNodeId};
use super::node::Task;

/// A worker machine: tracks heartbeat freshness, per-command resource
/// accounting, and the set of commands currently assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderNode {
    pub id: RenderNodeId,
    /// Unique, `FQDN:port`.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub cores_number: u32,
    pub free_cores: u32,
    pub used_cores: HashMap<CommandId, u32>,
    pub ram_size: u64,
    pub free_ram: u64,
    pub used_ram: HashMap<CommandId, u64>,
    pub speed: f64,
    pub caracteristics: HashMap<String, Value>,
    pub pools: Vec<PoolId>,
    pub status: RenderNodeStatus,
    pub is_registered: bool,
    pub last_alive_time: DateTime<Utc>,
    /// Non-owning set of commands assigned here (owning copies live in the
    /// dispatch tree's command map).
    pub commands: HashSet<CommandId>,
    pub current_pool_share: Option<PoolShareId>,
    /// Ring buffer of error-command timestamps, used for quarantine
    /// judgment (capacity = `RN_NB_ERRORS_TOLERANCE * 4`).
    pub history: VecDeque<DateTime<Utc>>,
    /// Task-nodes whose error has already been counted in `history`, so a
    /// task retried multiple times only counts once per window.
    pub tasks_history: HashSet<NodeId>,
    pub quarantined: bool,
}

impl RenderNode {
    pub fn new(
        id: RenderNodeId,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cores_number: u32,
        ram_size: u64,
        speed: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            cores_number,
            free_cores: cores_number,
            used_cores: HashMap::new(),
            ram_size,
            free_ram: ram_size,
            used_ram: HashMap::new(),
            speed,
            caracteristics: HashMap::new(),
            pools: Vec::new(),
            status: RenderNodeStatus::Unknown,
            is_registered: false,
            last_alive_time: Utc::now(),
            commands: HashSet::new(),
            current_pool_share: None,
            history: VecDeque::new(),
            tasks_history: HashSet::new(),
            quarantined: false,
        }
    }

    /// True if this render node is currently eligible for a new assignment.
    pub fn is_available(&self) -> bool {
        self.is_registered
            && !self.quarantined
            && self.status >= RenderNodeStatus::Idle
            && self.free_cores > 0
    }

    /// Requirement matching (spec §4.3 Step C / original `canRun`).
    ///
    /// - `"softs"` (case-insensitive): the requirement's list must be a
    ///   subset of the node's `softs` characteristic.
    /// - other keys: a two-element numeric array is a strict-exclusive
    ///   range `lo < value < hi`; otherwise a scalar comparison (`==` for
    ///   bool/string, `>=` for numbers -- i.e. fails if the node's value is
    ///   lower than required).
    pub fn can_run(&self, task: &Task) -> bool {
        for (requirement, value) in &task.requirements {
            if requirement.eq_ignore_ascii_case("softs") {
                let Some(needed) = value.as_array() else {
                    continue;
                };
                let softs = self
                    .caracteristics
                    .get("softs")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for soft in needed {
                    if !softs.contains(soft) {
                        return false;
                    }
                }
                continue;
            }

            let Some(caracteristic) = self.caracteristics.get(requirement) else {
                return false;
            };

            if let Some(range) = value.as_array().filter(|a| a.len() == 2) {
                let (Some(a), Some(b)) = (range[0].as_f64(), range[1].as_f64()) else {
                    return false;
                };
                let Some(c) = caracteristic.as_f64() else {
                    return false;
                };
                if !(a < c && c < b) {
                    return false;
                }
                continue;
            }

            match (caracteristic, value) {
                (Value::Bool(c), Value::Bool(v)) => {
                    if c != v {
                        return false;
                    }
                }
                (Value::String(c), Value::String(v)) => {
                    if c != v {
                        return false;
                    }
                }
                (Value::Number(_), Value::Number(_)) => {
                    let c = caracteristic.as_f64().unwrap_or(f64::MIN);
                    let v = value.as_f64().unwrap_or(0.0);
                    if c < v {
                        return false;
                    }
                }
                _ => return false,
            }
        }

        if task.min_cores > 0 {
            if self.free_cores < task.min_cores {
                return false;
            }
        } else if self.free_cores != self.cores_number {
            // all cores must be free when the task does not specify a minimum
            return false;
        }

        self.free_ram >= task.ram_use
    }

    /// Reserve resources for a newly-assigned command. If the task's
    /// requested amount is unset (0), the node's entire current free
    /// amount is reserved instead (matches the original's falsy-or
    /// fallback).
    pub fn reserve_resources(&mut self, command: CommandId, task: &Task) {
        let cores = if task.max_cores == 0 {
            self.free_cores
        } else {
            self.free_cores.min(task.max_cores)
        };
        self.used_cores.insert(command, cores);
        self.free_cores -= cores;

        let ram = if task.ram_use == 0 {
            self.free_ram
        } else {
            self.free_ram.min(task.ram_use)
        };
        self.used_ram.insert(command, ram);
        self.free_ram -= ram;
    }

    /// Release exactly the amounts recorded for `command` at reservation
    /// time.
    pub fn release_resources(&mut self, command: CommandId) {
        if let Some(cores) = self.used_cores.remove(&command) {
            self.free_cores += cores;
        }
        if let Some(ram) = self.used_ram.remove(&command) {
            self.free_ram += ram;
        }
    }
}
