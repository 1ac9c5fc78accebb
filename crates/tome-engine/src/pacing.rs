use std::str::FromStr;
use std::time::Duration;

/// Pause inserted between successful text turns to stay under provider
/// request quotas. Never applied after the last sendable text item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacingPolicy {
    None,
    /// Pause after every `n`th successful text turn.
    EveryNth { n: u32, pause: Duration },
    /// Pause after every successful text turn.
    Fixed(Duration),
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::EveryNth {
            n: 2,
            pause: Duration::from_secs(60),
        }
    }
}

impl PacingPolicy {
    /// Pause owed after a success, given the running success count.
    pub fn pause_after(&self, successes: u32, is_last: bool) -> Option<Duration> {
        if is_last {
            return None;
        }
        match self {
            Self::None => None,
            Self::EveryNth { n, pause } => {
                (*n > 0 && successes > 0 && successes % n == 0 && !pause.is_zero()).then_some(*pause)
            }
            Self::Fixed(pause) => (!pause.is_zero()).then_some(*pause),
        }
    }
}

/// `none`, `every:<n>:<secs>` or `fixed:<secs>`.
impl FromStr for PacingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let secs = |raw: &str| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("bad pacing seconds {raw:?}: {e}"))
        };
        match parts.as_slice() {
            ["none"] => Ok(Self::None),
            ["fixed", pause] => Ok(Self::Fixed(secs(pause)?)),
            ["every", n, pause] => {
                let n: u32 = n.parse().map_err(|e| format!("bad pacing count {n:?}: {e}"))?;
                if n == 0 {
                    return Err("pacing count must be at least 1".into());
                }
                Ok(Self::EveryNth {
                    n,
                    pause: secs(pause)?,
                })
            }
            _ => Err(format!("unknown pacing policy: {s}")),
        }
    }
}
