use std::collections::HashMap;
use std::ops::BitOr;
use std::time::Duration;

use fieldx::fxstruct;
use garde::Validate;
use strum::IntoEnumIterator;

use crate::error::Result;

/// What a deferred cache writer does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum QueueOverflow {
    /// Discard the oldest pending write. The newest query results are the freshest ones.
    #[default]
    DropOldest,
    /// Make the producer wait for a free slot.
    Wait,
}

#[derive(Debug, Clone, Validate)]
#[fxstruct(no_new, builder, get(copy))]
pub struct CacheSettings {
    /// Cache "confirmed absent" markers for keys a complete query result did not produce.
    #[fieldx(default(false))]
    #[garde(skip)]
    null_caching: bool,

    /// Upper bound of the random extra added to every expiration.
    #[fieldx(default(Duration::from_secs(1)))]
    #[garde(skip)]
    expiration_jitter: Duration,

    /// Page size used when sweeping or scanning a namespace.
    #[fieldx(default(500))]
    #[garde(range(min = 1))]
    scan_batch: usize,

    /// Maximum number of primary keys a single read may expand into.
    #[fieldx(default(1_000))]
    #[garde(range(min = 1))]
    max_key_combinations: usize,

    /// Bound of the deferred population queue.
    #[fieldx(default(1_024))]
    #[garde(range(min = 1))]
    queue_capacity: usize,

    #[fieldx(default(2))]
    #[garde(range(min = 1, max = 64))]
    workers: usize,

    #[fieldx(default(QueueOverflow::DropOldest))]
    #[garde(skip)]
    overflow: QueueOverflow,
}

impl CacheSettings {
    pub fn defaults() -> Self {
        Self::builder()
            .build()
            .expect("all cache settings have defaults")
    }

    pub fn checked(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Validate)]
#[fxstruct(no_new, builder, get(copy))]
pub struct ShardSettings {
    /// Drop records with the same entity identity when merging plain query results.
    #[fieldx(default(true))]
    #[garde(skip)]
    dedupe_list: bool,

    /// Same for paged results.
    #[fieldx(default(true))]
    #[garde(skip)]
    dedupe_paging: bool,

    /// Used for paged queries that specify a zero page size.
    #[fieldx(default(20))]
    #[garde(range(min = 1))]
    default_page_size: usize,
}

impl ShardSettings {
    pub fn defaults() -> Self {
        Self::builder()
            .build()
            .expect("all shard settings have defaults")
    }

    pub fn checked(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// Data operation families the cache policy reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum CommandBehavior {
    Add,
    Update,
    Remove,
    UpdateByQuery,
    RemoveByQuery,
    Query,
}

/// Bitmask of lifecycle phases a cache hook fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TriggerTiming(u8);

impl TriggerTiming {
    pub const AFTER: Self = Self(0b10);
    pub const BEFORE: Self = Self(0b01);
    pub const BOTH: Self = Self(0b11);
    pub const NONE: Self = Self(0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn before(self) -> bool {
        self.contains(Self::BEFORE)
    }

    pub fn after(self) -> bool {
        self.contains(Self::AFTER)
    }
}

impl BitOr for TriggerTiming {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub timing:       TriggerTiming,
    pub asynchronous: bool,
}

impl Trigger {
    pub const fn sync(timing: TriggerTiming) -> Self {
        Self {
            timing,
            asynchronous: false,
        }
    }

    pub const fn deferred(timing: TriggerTiming) -> Self {
        Self {
            timing,
            asynchronous: true,
        }
    }
}

/// Per-operation trigger configuration.
#[derive(Debug, Clone)]
pub struct TriggerTable {
    triggers: HashMap<CommandBehavior, Trigger>,
}

impl Default for TriggerTable {
    fn default() -> Self {
        let triggers = CommandBehavior::iter()
            .map(|behavior| {
                let trigger = match behavior {
                    CommandBehavior::Add => Trigger::sync(TriggerTiming::AFTER),
                    CommandBehavior::Update
                    | CommandBehavior::Remove
                    | CommandBehavior::UpdateByQuery
                    | CommandBehavior::RemoveByQuery => Trigger::sync(TriggerTiming::BOTH),
                    CommandBehavior::Query => Trigger::deferred(TriggerTiming::BOTH),
                };
                (behavior, trigger)
            })
            .collect();
        Self { triggers }
    }
}

impl TriggerTable {
    pub fn get(&self, behavior: CommandBehavior) -> Trigger {
        self.triggers
            .get(&behavior)
            .copied()
            .unwrap_or(Trigger::sync(TriggerTiming::NONE))
    }

    pub fn with(mut self, behavior: CommandBehavior, trigger: Trigger) -> Self {
        self.triggers.insert(behavior, trigger);
        self
    }
}
