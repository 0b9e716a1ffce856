use std::sync::Mutex;

use super::{Clock, SystemClock};

/// 2020-01-01T00:00:00Z in milliseconds.
const CUSTOM_EPOCH_MS: u64 = 1_577_836_800_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct IdState {
    last_ms: u64,
    sequence: u64,
}

/// Time-sortable 64-bit ids: milliseconds since a custom epoch, node id,
/// then a per-millisecond sequence.
pub struct IdGenerator {
    node_id: u64,
    clock: Box<dyn Clock>,
    state: Mutex<IdState>,
}

impl IdGenerator {
    pub fn new(node_id: u16) -> Self {
        Self::with_clock(node_id, Box::new(SystemClock))
    }

    pub fn with_clock(node_id: u16, clock: Box<dyn Clock>) -> Self {
        Self {
            node_id: u64::from(node_id.min(MAX_NODE_ID)),
            clock,
            state: Mutex::new(IdState::default()),
        }
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = self.clock.now_millis().max(CUSTOM_EPOCH_MS);
        // Never step backwards if the wall clock does.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::thread::yield_now();
                    now = self.clock.now_millis().max(state.last_ms);
                    if now == state.last_ms {
                        // A frozen clock would spin forever; borrow the next millisecond.
                        now = state.last_ms + 1;
                    }
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let elapsed = now - CUSTOM_EPOCH_MS;
        let id = (elapsed << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence;
        (id & i64::MAX as u64) as i64
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("node_id", &self.node_id)
            .finish()
    }
}
