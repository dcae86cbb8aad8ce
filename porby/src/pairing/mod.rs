//! PIN-based pairing: issuance, validation, lockout with a lazily-evaluated
//! cooldown. No timer fires on expiry; the next attempt re-checks the clock.


use rand::rngs::OsRng;
use rand::TryRngCore;
use std::time::{Duration, Instant};

use crate::config::TransportConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
  Accepted,
  Rejected { reason: String },
}

impl PairingOutcome {
  pub fn is_accepted(&self) -> bool {
    matches!(self, PairingOutcome::Accepted)
  }
}

#[derive(Debug)]
pub struct PairingManager {
  code: String,
  max_attempts: u32,
  cooldown: Duration,
  attempts: u32,
  cooldown_until: Option<Instant>,
}

impl PairingManager {
  pub fn new(transport: &TransportConfig) -> Self {
    let code = match &transport.fixed_pin {
      Some(pin) => pin.clone(),
      None => Self::random_code(),
    };
    Self {
      code,
      max_attempts: transport.max_pin_attempts.max(1),
      cooldown: transport.pin_cooldown,
      attempts: 0,
      cooldown_until: None,
    }
  }

  /// Four OS-random bytes, big-endian, reduced modulo one million and
  /// zero-padded to six digits.
  fn random_code() -> String {
    let mut bytes = [0u8; 4];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
      return format!("{:06}", rand::random::<u32>() % 1_000_000);
    }
    format!("{:06}", u32::from_be_bytes(bytes) % 1_000_000)
  }

  pub fn code(&self) -> &str {
    &self.code
  }

  pub fn validate(&mut self, code: &str) -> PairingOutcome {
    self.validate_at(code, Instant::now())
  }

  /// Clock-injected variant so lockout timing is testable.
  pub fn validate_at(&mut self, code: &str, now: Instant) -> PairingOutcome {
    if let Some(until) = self.cooldown_until {
      if now < until {
        let remaining = (until - now).as_secs_f64().ceil() as u64;
        return PairingOutcome::Rejected {
          reason: format!("Cooldown active. Try again in {}s", remaining),
        };
      }
      self.cooldown_until = None;
    }

    if code != self.code {
      self.attempts += 1;
      if self.attempts >= self.max_attempts {
        self.cooldown_until = Some(now + self.cooldown);
        self.attempts = 0;
        return PairingOutcome::Rejected {
          reason: format!(
            "Too many failed attempts. Locked for {}s",
            self.cooldown.as_secs()
          ),
        };
      }
      let remaining = self.max_attempts - self.attempts;
      return PairingOutcome::Rejected {
        reason: format!("Invalid code. {} attempts remaining", remaining),
      };
    }

    self.attempts = 0;
    self.cooldown_until = None;
    PairingOutcome::Accepted
  }
}
