use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  Days,
  Months,
  NaiveDate,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use serde::{
  Deserialize,
  Deserializer,
  Serialize,
  Serializer
};

const TIMEZONE_CONFIG_FILE: &str =
  "cadence-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "CADENCE_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "CADENCE_TIME_CONFIG";

const CANONICAL_FORMAT: &str =
  "%Y-%m-%d";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

pub fn project_timezone() -> &'static Tz
{
  static PROJECT_TZ: OnceLock<Tz> =
    OnceLock::new();
  PROJECT_TZ.get_or_init(
    resolve_project_timezone
  )
}

fn resolve_project_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  tracing::debug!(
    "no project timezone configured; \
     using UTC"
  );
  chrono_tz::UTC
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// A calendar date in the viewer's
/// local calendar, without a time
/// component. Serialized as
/// `YYYY-MM-DD`.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
)]
pub struct CanonicalDate(NaiveDate);

impl CanonicalDate {
  #[must_use]
  pub fn from_ymd(
    year: i32,
    month: u32,
    day: u32
  ) -> Option<Self> {
    NaiveDate::from_ymd_opt(
      year, month, day
    )
    .map(Self)
  }

  #[must_use]
  pub fn from_naive(
    date: NaiveDate
  ) -> Self {
    Self(date)
  }

  /// Project-local calendar date of a
  /// UTC instant.
  #[must_use]
  pub fn from_instant(
    dt: DateTime<Utc>
  ) -> Self {
    Self(
      dt.with_timezone(
        project_timezone()
      )
      .date_naive()
    )
  }

  #[must_use]
  pub fn today() -> Self {
    Self::from_instant(Utc::now())
  }

  #[must_use]
  pub fn naive(&self) -> NaiveDate {
    self.0
  }

  #[must_use]
  pub fn weekday(&self) -> Weekday {
    self.0.weekday()
  }

  #[must_use]
  pub fn add_days(
    &self,
    days: u64
  ) -> Option<Self> {
    self
      .0
      .checked_add_days(Days::new(days))
      .map(Self)
  }

  #[must_use]
  pub fn sub_days(
    &self,
    days: u64
  ) -> Option<Self> {
    self
      .0
      .checked_sub_days(Days::new(days))
      .map(Self)
  }

  /// Adds calendar months, clamping
  /// the day to the end of shorter
  /// months.
  #[must_use]
  pub fn add_months(
    &self,
    months: u32
  ) -> Option<Self> {
    self
      .0
      .checked_add_months(Months::new(
        months
      ))
      .map(Self)
  }
}

impl fmt::Display for CanonicalDate {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    write!(
      f,
      "{}",
      self.0.format(CANONICAL_FORMAT)
    )
  }
}

impl FromStr for CanonicalDate {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    normalize(s).ok_or_else(|| {
      anyhow!(
        "unrecognized date: {s} \
         (expected YYYY-MM-DD, \
         YYYY/MM/DD or \
         today/tomorrow/yesterday)"
      )
    })
  }
}

impl Serialize for CanonicalDate {
  fn serialize<S>(
    &self,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de>
  for CanonicalDate
{
  fn deserialize<D>(
    deserializer: D
  ) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    normalize(raw.as_str()).ok_or_else(
      || {
        serde::de::Error::custom(
          format!(
            "malformed date: {raw}"
          )
        )
      }
    )
  }
}

/// Every shape a date arrives in from
/// the wire, the user or the clock.
#[derive(Debug, Clone, Copy)]
pub enum DateInput<'a> {
  Text(&'a str),
  Instant(DateTime<Utc>),
  Local(NaiveDate)
}

impl<'a> From<&'a str> for DateInput<'a> {
  fn from(value: &'a str) -> Self {
    Self::Text(value)
  }
}

impl<'a> From<&'a String>
  for DateInput<'a>
{
  fn from(value: &'a String) -> Self {
    Self::Text(value.as_str())
  }
}

impl From<DateTime<Utc>>
  for DateInput<'_>
{
  fn from(value: DateTime<Utc>) -> Self {
    Self::Instant(value)
  }
}

impl From<NaiveDate> for DateInput<'_> {
  fn from(value: NaiveDate) -> Self {
    Self::Local(value)
  }
}

impl From<CanonicalDate>
  for DateInput<'_>
{
  fn from(
    value: CanonicalDate
  ) -> Self {
    Self::Local(value.0)
  }
}

/// Normalizes against the project-local
/// today.
#[must_use]
pub fn normalize<'a>(
  input: impl Into<DateInput<'a>>
) -> Option<CanonicalDate> {
  normalize_at(
    input,
    CanonicalDate::today()
  )
}

/// Normalizes any supported input into
/// a canonical date. Relative keywords
/// resolve against `today`. Malformed
/// input yields `None`.
#[must_use]
pub fn normalize_at<'a>(
  input: impl Into<DateInput<'a>>,
  today: CanonicalDate
) -> Option<CanonicalDate> {
  match input.into() {
    | DateInput::Local(date) => {
      Some(CanonicalDate(date))
    }
    | DateInput::Instant(dt) => {
      Some(CanonicalDate::from_instant(
        dt
      ))
    }
    | DateInput::Text(text) => {
      normalize_text(text, today)
    }
  }
}

fn normalize_text(
  text: &str,
  today: CanonicalDate
) -> Option<CanonicalDate> {
  let token = text.trim();
  if token.is_empty() {
    return None;
  }

  match token
    .to_ascii_lowercase()
    .as_str()
  {
    | "today" => return Some(today),
    | "tomorrow" => {
      return today.add_days(1);
    }
    | "yesterday" => {
      return today.sub_days(1);
    }
    | _ => {}
  }

  // Date-only values are stored at
  // midnight UTC by the server; the
  // calendar part is taken literally.
  let prefix = token.get(..10)?;
  let rest = &token[10..];
  if !rest.is_empty()
    && !rest.starts_with(['T', ' ', 't'])
  {
    return None;
  }

  NaiveDate::parse_from_str(
    prefix,
    CANONICAL_FORMAT
  )
  .or_else(|_| {
    NaiveDate::parse_from_str(
      prefix, "%Y/%m/%d"
    )
  })
  .ok()
  .map(CanonicalDate)
}

pub fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

#[must_use]
pub fn weekday_name(
  day: Weekday
) -> &'static str {
  match day {
    | Weekday::Mon => "monday",
    | Weekday::Tue => "tuesday",
    | Weekday::Wed => "wednesday",
    | Weekday::Thu => "thursday",
    | Weekday::Fri => "friday",
    | Weekday::Sat => "saturday",
    | Weekday::Sun => "sunday"
  }
}

/// Serde helpers for optional dates on
/// wire entities. Anything that does not
/// normalize becomes `None` instead of
/// failing the whole entity.
pub mod lenient_date {
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };
  use serde_json::Value;

  use super::{
    CanonicalDate,
    normalize
  };

  pub fn serialize<S>(
    date: &Option<CanonicalDate>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    match date {
      | Some(value) => {
        serializer.collect_str(value)
      }
      | None => {
        serializer.serialize_none()
      }
    }
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<
    Option<CanonicalDate>,
    D::Error
  >
  where
    D: Deserializer<'de>
  {
    let raw =
      Option::<Value>::deserialize(
        deserializer
      )?;
    let parsed = match &raw {
      | Some(Value::String(text)) => {
        normalize(text)
      }
      | _ => None
    };
    if parsed.is_none()
      && let Some(value) = raw
      && !value.is_null()
    {
      tracing::debug!(
        %value,
        "malformed date treated as no date"
      );
    }
    Ok(parsed)
  }
}
