//! The effective rate limit policy applied to one request.

use serde::Serialize;

use super::window::{Window, WindowLimit};
use crate::error::PolicyError;

/// An immutable, validated rate limit policy.
///
/// Constructed only through [`RateLimitPolicy::new`], so every instance holds
/// at least one window, non-zero ceilings, a burst of at least one token and
/// a positive refill rate. Windows are kept sorted shortest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitPolicy {
    name: String,
    window_limits: Vec<WindowLimit>,
    burst_size: u64,
    refill_rate: f64,
    explicit_refill: bool,
    cost_multiplier: f64,
}

impl RateLimitPolicy {
    /// Validate and build a policy.
    ///
    /// When `refill_rate` is `None` it is derived from the minute window, or
    /// from the shortest window when no minute window is configured.
    pub fn new(
        name: impl Into<String>,
        mut window_limits: Vec<WindowLimit>,
        burst_size: u64,
        refill_rate: Option<f64>,
        cost_multiplier: f64,
    ) -> Result<Self, PolicyError> {
        let name = name.into();

        if window_limits.is_empty() {
            return Err(PolicyError::NoWindows(name));
        }

        window_limits.sort_by_key(|limit| limit.window.as_secs());

        for (i, limit) in window_limits.iter().enumerate() {
            if limit.window.as_secs() == 0 {
                return Err(PolicyError::ZeroLengthWindow(name));
            }
            if limit.max_requests == 0 {
                return Err(PolicyError::ZeroMaxRequests {
                    policy: name,
                    window: limit.window.name(),
                });
            }
            if i > 0 && window_limits[i - 1].window.as_secs() == limit.window.as_secs() {
                return Err(PolicyError::DuplicateWindow {
                    policy: name,
                    window: limit.window.name(),
                });
            }
        }

        if burst_size == 0 {
            return Err(PolicyError::ZeroBurst(name));
        }

        if !cost_multiplier.is_finite() || cost_multiplier < 0.0 {
            return Err(PolicyError::InvalidMultiplier {
                owner: name,
                field: "cost_multiplier",
                value: cost_multiplier,
            });
        }

        let explicit_refill = refill_rate.is_some();
        let refill_rate = refill_rate.unwrap_or_else(|| derive_refill_rate(&window_limits));
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(PolicyError::InvalidRefillRate {
                policy: name,
                rate: refill_rate,
            });
        }

        Ok(Self {
            name,
            window_limits,
            burst_size,
            refill_rate,
            explicit_refill,
            cost_multiplier,
        })
    }

    /// Label describing where this policy came from (tier, service, endpoint).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Window ceilings, shortest window first.
    pub fn window_limits(&self) -> &[WindowLimit] {
        &self.window_limits
    }

    pub fn burst_size(&self) -> u64 {
        self.burst_size
    }

    /// Tokens added to the bucket per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn cost_multiplier(&self) -> f64 {
        self.cost_multiplier
    }

    pub fn longest_window(&self) -> Window {
        // Non-empty by construction.
        self.window_limits
            .last()
            .map(|limit| limit.window)
            .unwrap_or(Window::Second)
    }

    /// Milliseconds an empty bucket needs to refill to `burst_size`.
    pub fn full_refill_millis(&self) -> u64 {
        (self.burst_size as f64 * 1000.0 / self.refill_rate).ceil() as u64
    }

    /// How long counter state for this policy stays meaningful after the
    /// last admitted request.
    pub fn retention_millis(&self) -> u64 {
        self.longest_window()
            .as_millis()
            .max(self.full_refill_millis())
    }

    /// Scale window ceilings and burst by a service multiplier.
    ///
    /// Scaled values are floored and never drop below one. An explicitly
    /// configured refill rate is scaled with them; a derived one is derived
    /// again from the scaled windows.
    pub fn scaled(&self, multiplier: f64, name: impl Into<String>) -> Self {
        let scale = |value: u64| ((value as f64 * multiplier).floor() as u64).max(1);

        let window_limits: Vec<WindowLimit> = self
            .window_limits
            .iter()
            .map(|limit| WindowLimit::new(limit.window, scale(limit.max_requests)))
            .collect();

        let refill_rate = if self.explicit_refill {
            self.refill_rate * multiplier
        } else {
            derive_refill_rate(&window_limits)
        };

        Self {
            name: name.into(),
            window_limits,
            burst_size: scale(self.burst_size),
            refill_rate,
            explicit_refill: self.explicit_refill,
            cost_multiplier: self.cost_multiplier,
        }
    }

    /// Return a copy weighing requests with a different cost multiplier.
    pub fn with_cost_multiplier(mut self, cost_multiplier: f64) -> Self {
        self.cost_multiplier = cost_multiplier;
        self
    }

    /// Tokens a request with the given cost hint withdraws from the bucket.
    ///
    /// Invalid hints count as a single request. The result is capped at
    /// `burst_size` so an expensive request can always eventually pass.
    pub fn effective_cost(&self, cost_hint: f64) -> f64 {
        let hint = if cost_hint.is_finite() && cost_hint >= 0.0 {
            cost_hint
        } else {
            1.0
        };
        (hint * self.cost_multiplier).min(self.burst_size as f64)
    }
}

fn derive_refill_rate(window_limits: &[WindowLimit]) -> f64 {
    let basis = window_limits
        .iter()
        .find(|limit| limit.window == Window::Minute)
        .or_else(|| window_limits.first());

    match basis {
        Some(limit) if limit.window.as_secs() > 0 => {
            limit.max_requests as f64 / limit.window.as_secs() as f64
        }
        _ => 0.0,
    }
}
