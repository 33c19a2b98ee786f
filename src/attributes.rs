//! # Permission, Ownership & Timestamp Resolution
//!
//! Every entry's effective mode, owner and modification time is resolved here, by precedence:
//!
//! 1. per-file explicit mode
//! 2. per-collection forced mode ([`CollectionOverrides`])
//! 3. global forced values ([`PermissionConfig`] `forced_*`)
//! 4. filesystem-detected values (skipped entirely in reproducible mode)
//! 5. built-in defaults
//!
//! In reproducible mode ([`ReproducibilityConfig`]) the detected tier is bypassed, one fixed
//! time is forced on every entry and ownership falls back to uid/gid 0.
//!
//! Containers cannot store arbitrary timestamps: zip keeps DOS local time with a two second
//! resolution, tar keeps whole seconds. [`TimeGranularity::normalize`] snaps a time onto that
//! grid and [`to_dos`]/[`from_dos`] are exact inverses on normalized values.

use crate::common::{EntryAttributes, EntryKind, Owner};
use crate::resource::ResourceHandle;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_SYMLINK_MODE: u32 = 0o777;

/// 1980-01-01T00:00:00Z, the earliest instant a zip entry can carry.
pub const DOS_EPOCH_SECS: i64 = 315_532_800;

const MODE_MASK: u32 = 0o7777;

/// Global forced and default permission/owner settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PermissionConfig {
    /// Overrides every detected file mode when set.
    pub forced_file_mode: Option<u32>,
    /// Overrides every detected directory mode when set.
    pub forced_dir_mode: Option<u32>,
    /// Used when nothing else provides a file mode.
    pub default_file_mode: u32,
    /// Used when nothing else provides a directory mode.
    pub default_dir_mode: u32,
    /// Fields set here win over detected ownership.
    pub forced_owner: Owner,
    /// Fields set here are used when nothing was detected.
    pub default_owner: Owner,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            forced_file_mode: None,
            forced_dir_mode: None,
            default_file_mode: DEFAULT_FILE_MODE,
            default_dir_mode: DEFAULT_DIR_MODE,
            forced_owner: Owner::default(),
            default_owner: Owner::default(),
        }
    }
}

/// Settings for byte-reproducible output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReproducibilityConfig {
    /// Modification time forced onto every entry, in seconds since the Unix epoch.
    pub mtime: i64,
    pub uid: u32,
    pub user_name: String,
    pub gid: u32,
    pub group_name: String,
}

impl Default for ReproducibilityConfig {
    fn default() -> Self {
        Self {
            mtime: DOS_EPOCH_SECS,
            uid: 0,
            user_name: String::new(),
            gid: 0,
            group_name: String::new(),
        }
    }
}

impl ReproducibilityConfig {
    /// Reproducible settings forcing `mtime` on every entry.
    pub fn at(mtime: SystemTime) -> Self {
        let secs = match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        };
        Self { mtime: secs, ..Self::default() }
    }

    /// Reads the `SOURCE_DATE_EPOCH` environment variable, if set and valid.
    pub fn from_source_date_epoch() -> Option<Self> {
        std::env::var("SOURCE_DATE_EPOCH")
            .ok()
            .and_then(|v| parse_source_date_epoch(&v))
    }

    pub fn forced_time(&self) -> SystemTime {
        if self.mtime >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.mtime as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.mtime.unsigned_abs())
        }
    }

    fn owner(&self) -> Owner {
        let name = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        Owner {
            uid: Some(self.uid),
            user_name: name(&self.user_name),
            gid: Some(self.gid),
            group_name: name(&self.group_name),
        }
    }
}

fn parse_source_date_epoch(value: &str) -> Option<ReproducibilityConfig> {
    let secs = value.trim().parse::<i64>().ok()?;
    Some(ReproducibilityConfig { mtime: secs, ..ReproducibilityConfig::default() })
}

/// Modes forced on everything one collection contributes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionOverrides {
    pub file_mode: Option<u32>,
    pub dir_mode: Option<u32>,
}

/// Resolves [`EntryAttributes`] for entries of one build.
#[derive(Debug, Clone, Default)]
pub struct AttributeResolver {
    permissions: PermissionConfig,
    reproducible: Option<ReproducibilityConfig>,
}

impl AttributeResolver {
    pub fn new(permissions: PermissionConfig, reproducible: Option<ReproducibilityConfig>) -> Self {
        Self { permissions, reproducible }
    }

    pub fn is_reproducible(&self) -> bool {
        self.reproducible.is_some()
    }

    /// Resolve mode, owner and time for one entry.
    ///
    /// `detected` is the backing resource, consulted only outside reproducible mode.
    pub fn resolve(
        &self,
        kind: EntryKind,
        detected: Option<&dyn ResourceHandle>,
        explicit_mode: Option<u32>,
        overrides: CollectionOverrides,
    ) -> EntryAttributes {
        let detected = if self.reproducible.is_some() { None } else { detected };

        let mode = explicit_mode
            .or_else(|| self.forced_mode(kind, overrides))
            .or_else(|| detected.and_then(|r| r.mode()))
            .unwrap_or_else(|| self.default_mode(kind))
            & MODE_MASK;

        let mut owner = self.permissions.forced_owner.clone();
        if let Some(repro) = &self.reproducible {
            owner = owner.or(&repro.owner());
        }
        if let Some(found) = detected.map(|r| r.owner()) {
            owner = owner.or(&found);
        }
        let owner = owner.or(&self.permissions.default_owner);

        let mtime = match &self.reproducible {
            Some(repro) => repro.forced_time(),
            None => detected
                .and_then(|r| r.last_modified())
                .unwrap_or_else(SystemTime::now),
        };

        EntryAttributes { mode, owner, mtime }
    }

    /// Mode used for directories synthesized as parents of a collection's entries.
    pub fn directory_mode(&self, overrides: CollectionOverrides) -> u32 {
        self.forced_mode(EntryKind::Directory, overrides)
            .unwrap_or(self.permissions.default_dir_mode)
            & MODE_MASK
    }

    fn forced_mode(&self, kind: EntryKind, overrides: CollectionOverrides) -> Option<u32> {
        match kind {
            EntryKind::File => overrides.file_mode.or(self.permissions.forced_file_mode),
            EntryKind::Directory => overrides.dir_mode.or(self.permissions.forced_dir_mode),
            EntryKind::Symlink => None,
        }
    }

    fn default_mode(&self, kind: EntryKind) -> u32 {
        match kind {
            EntryKind::File => self.permissions.default_file_mode,
            EntryKind::Directory => self.permissions.default_dir_mode,
            EntryKind::Symlink => DEFAULT_SYMLINK_MODE,
        }
    }
}

/// Resolution of a container's timestamp field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    /// Whole seconds, sub-second part truncated (tar).
    Seconds,
    /// Even seconds, rounded up (zip / DOS time).
    TwoSeconds,
}

impl TimeGranularity {
    /// Snap `t` onto the grid this container can represent. Times before the epoch clamp to it.
    pub fn normalize(self, t: SystemTime) -> SystemTime {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut secs = d.as_secs();
        if self == TimeGranularity::TwoSeconds {
            if d.subsec_nanos() > 0 {
                secs += 1;
            }
            if secs % 2 == 1 {
                secs += 1;
            }
        }
        UNIX_EPOCH + Duration::from_secs(secs)
    }
}

/// Which wall clock zip DOS fields are expressed in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeZoneMode {
    /// The process' local zone, as zip tools conventionally do.
    #[default]
    Local,
    /// UTC, independent of the process timezone (used for reproducible builds).
    Utc,
}

/// Broken-down DOS date/time fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

const DOS_MIN: DosDateTime = DosDateTime { year: 1980, month: 1, day: 1, hour: 0, minute: 0, second: 0 };
const DOS_MAX: DosDateTime = DosDateTime { year: 2107, month: 12, day: 31, hour: 23, minute: 59, second: 58 };

/// Encode `t` (rounded up to two seconds first) into DOS fields, clamped to the DOS range.
pub fn to_dos(t: SystemTime, zone: TimeZoneMode) -> DosDateTime {
    let t = TimeGranularity::TwoSeconds.normalize(t);
    let utc: DateTime<Utc> = DateTime::from(t);
    let naive = match zone {
        TimeZoneMode::Utc => utc.naive_utc(),
        TimeZoneMode::Local => utc.with_timezone(&chrono::Local).naive_local(),
    };
    if naive.year() < 1980 {
        return DOS_MIN;
    }
    if naive.year() > 2107 {
        return DOS_MAX;
    }
    DosDateTime {
        year: naive.year() as u16,
        month: naive.month() as u8,
        day: naive.day() as u8,
        hour: naive.hour() as u8,
        minute: naive.minute() as u8,
        second: naive.second() as u8,
    }
}

/// Decode DOS fields back into an instant. `None` for impossible dates or skipped local times.
pub fn from_dos(d: &DosDateTime, zone: TimeZoneMode) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(d.year as i32, d.month as u32, d.day as u32)?
        .and_hms_opt(d.hour as u32, d.minute as u32, d.second as u32)?;
    let utc = match zone {
        TimeZoneMode::Utc => Utc.from_utc_datetime(&naive),
        TimeZoneMode::Local => chrono::Local
            .from_local_datetime(&naive)
            .earliest()?
            .with_timezone(&Utc),
    };
    Some(SystemTime::from(utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::file::MemoryResource;

    fn detected(mode: u32) -> MemoryResource {
        MemoryResource::new("a.txt", b"abc".to_vec())
            .with_mode(mode)
            .with_mtime(UNIX_EPOCH + Duration::from_secs(1_600_000_000))
    }

    #[test]
    fn mode_precedence() {
        let res = detected(0o600);
        let mut perms = PermissionConfig::default();
        let plain = AttributeResolver::new(perms.clone(), None);
        let none = CollectionOverrides::default();

        // detected beats default
        assert_eq!(plain.resolve(EntryKind::File, Some(&res), None, none).mode, 0o600);
        // default when nothing detected
        assert_eq!(plain.resolve(EntryKind::File, None, None, none).mode, DEFAULT_FILE_MODE);

        // global forced beats detected
        perms.forced_file_mode = Some(0o640);
        let forced = AttributeResolver::new(perms, None);
        assert_eq!(forced.resolve(EntryKind::File, Some(&res), None, none).mode, 0o640);

        // collection forced beats global forced
        let coll = CollectionOverrides { file_mode: Some(0o444), dir_mode: None };
        assert_eq!(forced.resolve(EntryKind::File, Some(&res), None, coll).mode, 0o444);

        // explicit beats everything
        assert_eq!(forced.resolve(EntryKind::File, Some(&res), Some(0o700), coll).mode, 0o700);
    }

    #[test]
    fn reproducible_skips_detected_values() {
        let res = detected(0o600);
        let repro = ReproducibilityConfig::at(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let resolver = AttributeResolver::new(PermissionConfig::default(), Some(repro));
        let attrs = resolver.resolve(EntryKind::File, Some(&res), None, CollectionOverrides::default());
        assert_eq!(attrs.mode, DEFAULT_FILE_MODE);
        assert_eq!(attrs.mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert_eq!(attrs.owner.uid, Some(0));
        assert_eq!(attrs.owner.gid, Some(0));
        assert_eq!(attrs.owner.user_name, None);
    }

    #[test]
    fn global_forced_owner_wins_over_reproducible_sentinel() {
        let mut perms = PermissionConfig::default();
        perms.forced_owner.uid = Some(1000);
        perms.forced_owner.user_name = Some("builder".into());
        let resolver = AttributeResolver::new(perms, Some(ReproducibilityConfig::default()));
        let attrs = resolver.resolve(EntryKind::File, None, None, CollectionOverrides::default());
        assert_eq!(attrs.owner.uid, Some(1000));
        assert_eq!(attrs.owner.user_name.as_deref(), Some("builder"));
        assert_eq!(attrs.owner.gid, Some(0));
    }

    #[test]
    fn implied_directory_mode() {
        let resolver = AttributeResolver::default();
        assert_eq!(resolver.directory_mode(CollectionOverrides::default()), DEFAULT_DIR_MODE);
        let coll = CollectionOverrides { file_mode: None, dir_mode: Some(0o700) };
        assert_eq!(resolver.directory_mode(coll), 0o700);
    }

    #[test]
    fn granularity_rounding() {
        let t = |s: u64, n: u32| UNIX_EPOCH + Duration::new(s, n);
        assert_eq!(TimeGranularity::TwoSeconds.normalize(t(10, 0)), t(10, 0));
        assert_eq!(TimeGranularity::TwoSeconds.normalize(t(11, 0)), t(12, 0));
        assert_eq!(TimeGranularity::TwoSeconds.normalize(t(10, 1)), t(12, 0));
        assert_eq!(TimeGranularity::Seconds.normalize(t(11, 999_999_999)), t(11, 0));
    }

    #[test]
    fn dos_roundtrip_is_exact_on_normalized_times() {
        for zone in [TimeZoneMode::Utc, TimeZoneMode::Local] {
            for secs in [1_600_000_001u64, 1_700_000_000, 1_234_567_891] {
                let input = UNIX_EPOCH + Duration::new(secs, 250);
                let normalized = TimeGranularity::TwoSeconds.normalize(input);
                let decoded = from_dos(&to_dos(input, zone), zone).unwrap();
                assert_eq!(decoded, normalized, "zone {zone:?}, secs {secs}");
            }
        }
    }

    #[test]
    fn utc_dos_fields_do_not_depend_on_local_zone() {
        // 2023-11-14T22:13:20Z
        let fields = to_dos(UNIX_EPOCH + Duration::from_secs(1_700_000_000), TimeZoneMode::Utc);
        assert_eq!(fields, DosDateTime { year: 2023, month: 11, day: 14, hour: 22, minute: 13, second: 20 });
    }

    #[test]
    fn dos_clamps_pre_1980() {
        assert_eq!(to_dos(UNIX_EPOCH, TimeZoneMode::Utc), DOS_MIN);
    }

    #[test]
    fn source_date_epoch_parsing() {
        assert_eq!(parse_source_date_epoch(" 1700000000\n").map(|c| c.mtime), Some(1_700_000_000));
        assert!(parse_source_date_epoch("yesterday").is_none());
    }
}
