//! Thread priorities using the CMSIS-RTOS v2 numeric levels.
//!
//! Larger values are more urgent. Each named class spans eight consecutive
//! levels (`LOW` .. `LOW + 7`), so ports can fine-tune inside a class with
//! [`ThreadPriority::raised`].

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(i32);

impl ThreadPriority {
    /// "No priority requested"; resolved to [`ThreadPriority::NORMAL`] at creation.
    pub const NONE: Self = Self(0);
    pub const IDLE: Self = Self(1);
    pub const LOW: Self = Self(8);
    pub const BELOW_NORMAL: Self = Self(16);
    pub const NORMAL: Self = Self(24);
    pub const ABOVE_NORMAL: Self = Self(32);
    pub const HIGH: Self = Self(40);
    pub const REALTIME: Self = Self(48);
    pub const REALTIME7: Self = Self(55);
    /// Reserved for interrupt deferral; never valid for an application thread.
    pub const ISR: Self = Self(56);
    /// Sentinel returned by lookups on an invalid handle.
    pub const ERROR: Self = Self(-1);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Level `steps` above `self` within the same class, saturating at the
    /// class ceiling.
    pub const fn raised(self, steps: u8) -> Self {
        if self.0 < Self::LOW.0 || self.0 > Self::REALTIME7.0 {
            return self;
        }
        let base = self.0 - self.0 % 8;
        let level = self.0 + steps as i32;
        if level > base + 7 {
            Self(base + 7)
        } else {
            Self(level)
        }
    }

    pub const fn is_valid_for_thread(self) -> bool {
        self.0 >= Self::IDLE.0 && self.0 <= Self::REALTIME7.0
    }

    pub const fn class_name(self) -> &'static str {
        match self.0 {
            1 => "Idle",
            8..=15 => "Low",
            16..=23 => "BelowNormal",
            24..=31 => "Normal",
            32..=39 => "AboveNormal",
            40..=47 => "High",
            48..=55 => "Realtime",
            56 => "ISR",
            0 => "None",
            _ => "Error",
        }
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl core::fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let class = self.class_name();
        let offset = if self.0 >= Self::LOW.0 && self.0 <= Self::REALTIME7.0 {
            self.0 % 8
        } else {
            0
        };
        if offset == 0 {
            write!(f, "{}", class)
        } else {
            write!(f, "{}{}", class, offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_range_excludes_reserved_levels() {
        assert!(ThreadPriority::IDLE.is_valid_for_thread());
        assert!(ThreadPriority::REALTIME7.is_valid_for_thread());
        assert!(!ThreadPriority::NONE.is_valid_for_thread());
        assert!(!ThreadPriority::ISR.is_valid_for_thread());
        assert!(!ThreadPriority::ERROR.is_valid_for_thread());
        assert!(!ThreadPriority::from_raw(99).is_valid_for_thread());
    }

    #[test]
    fn raised_stays_within_class() {
        assert_eq!(ThreadPriority::NORMAL.raised(3).raw(), 27);
        assert_eq!(ThreadPriority::NORMAL.raised(20).raw(), 31);
        assert_eq!(ThreadPriority::IDLE.raised(2), ThreadPriority::IDLE);
    }

    #[test]
    fn ordering_follows_urgency() {
        assert!(ThreadPriority::HIGH > ThreadPriority::NORMAL);
        assert!(ThreadPriority::NORMAL.raised(1) > ThreadPriority::NORMAL);
        assert_eq!(ThreadPriority::default(), ThreadPriority::NORMAL);
    }

    #[test]
    fn display_names_levels() {
        assert_eq!(ThreadPriority::HIGH.to_string(), "High");
        assert_eq!(ThreadPriority::LOW.raised(2).to_string(), "Low2");
    }
}
