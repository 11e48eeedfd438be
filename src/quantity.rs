#[macro_use]
mod macros;

use std::ops::Mul;

use chrono::TimeDelta;

quantity!(Watts, suffix: "W", precision: 1);
quantity!(WattHours, suffix: "Wh", precision: 1);
quantity!(Hours, suffix: "h", precision: 3);
quantity!(Volts, suffix: "V", precision: 1);
quantity!(Amperes, suffix: "A", precision: 2);
quantity!(VoltAmperes, suffix: "VA", precision: 1);
quantity!(VoltAmperesReactive, suffix: "var", precision: 1);

impl Watts {
    /// Midpoint of two power readings, used for the trapezoidal rule.
    pub fn average(self, other: Self) -> Self {
        Self(f64::midpoint(self.0, other.0))
    }
}

impl Mul<Hours> for Watts {
    type Output = WattHours;

    fn mul(self, hours: Hours) -> Self::Output {
        WattHours(self.0 * hours.0)
    }
}

impl From<TimeDelta> for Hours {
    fn from(time_delta: TimeDelta) -> Self {
        Self(time_delta.as_seconds_f64() / 3600.0)
    }
}
