use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const MIN_COLS: u16 = 20;
pub const MAX_COLS: u16 = 300;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 100;
pub const MIN_ASPECT: f32 = 0.3;
pub const MAX_ASPECT: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// How the client arrived at the geometry it proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSource {
    /// Measured from the rendered viewport and font metrics.
    Measured,
    Estimated,
    /// Carried over from a previous session.
    Restored,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
    pub confidence: Confidence,
    pub source: DimensionSource,
}

impl Dimensions {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            confidence: Confidence::High,
            source: DimensionSource::Measured,
        }
    }

    pub fn aspect(&self) -> f32 {
        if self.rows == 0 {
            return f32::INFINITY;
        }
        f32::from(self.cols) / f32::from(self.rows)
    }
}

/// Device-class ceiling applied to geometry that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionLimits {
    pub max_cols: u16,
    pub max_rows: u16,
}

impl DimensionLimits {
    pub fn new(max_cols: u16, max_rows: u16) -> Self {
        Self {
            max_cols: max_cols.clamp(MIN_COLS, MAX_COLS),
            max_rows: max_rows.clamp(MIN_ROWS, MAX_ROWS),
        }
    }
}

impl Default for DimensionLimits {
    fn default() -> Self {
        Self {
            max_cols: MAX_COLS,
            max_rows: MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RejectReason {
    #[error("aspect ratio {ratio:.2} outside 0.3..=8.0")]
    AspectRatio { ratio: f32 },
    #[error("cols {cols} outside 20..=300")]
    ColsOutOfRange { cols: u16 },
    #[error("rows {rows} outside 5..=100")]
    RowsOutOfRange { rows: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedDimensions {
    pub cols: u16,
    pub rows: u16,
    pub adjusted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRejection {
    pub reason: RejectReason,
    pub suggested_cols: u16,
    pub suggested_rows: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DimensionDecision {
    Confirmed(ConfirmedDimensions),
    Rejected(DimensionRejection),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionValidator {
    limits: DimensionLimits,
}

impl DimensionValidator {
    pub fn new(limits: DimensionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> DimensionLimits {
        self.limits
    }

    pub fn validate(&self, proposed: &Dimensions) -> DimensionDecision {
        if let Some(reason) = first_violation(proposed) {
            let (suggested_cols, suggested_rows) = self.fit(proposed.cols, proposed.rows);
            return DimensionDecision::Rejected(DimensionRejection {
                reason,
                suggested_cols,
                suggested_rows,
            });
        }

        if proposed.confidence == Confidence::Low && proposed.source == DimensionSource::Default {
            debug!(
                target: "beach_stream::dimensions",
                cols = proposed.cols,
                rows = proposed.rows,
                "accepting low-confidence fallback geometry"
            );
        }

        let (cols, rows) = self.fit(proposed.cols, proposed.rows);
        let adjusted = cols != proposed.cols || rows != proposed.rows;
        let reason = adjusted.then(|| {
            format!(
                "clamped {}x{} to {}x{} for device maximum {}x{}",
                proposed.cols, proposed.rows, cols, rows, self.limits.max_cols, self.limits.max_rows
            )
        });
        DimensionDecision::Confirmed(ConfirmedDimensions {
            cols,
            rows,
            adjusted,
            reason,
        })
    }

    /// Nearest geometry that passes validation and fits the device limits:
    /// clamp both axes, then restore the aspect ratio, trimming cols when
    /// rows are already capped.
    fn fit(&self, cols: u16, rows: u16) -> (u16, u16) {
        let max_cols = self.limits.max_cols;
        let max_rows = self.limits.max_rows;
        let mut cols = cols.clamp(MIN_COLS, max_cols);
        let mut rows = rows.clamp(MIN_ROWS, max_rows);

        // Too wide: cols / rows > 8.
        if u32::from(cols) > 8 * u32::from(rows) {
            let needed = cols.div_ceil(8);
            if needed <= max_rows {
                rows = needed.max(MIN_ROWS);
            } else {
                rows = max_rows;
                cols = rows.saturating_mul(8).clamp(MIN_COLS, max_cols);
            }
        }
        // Too tall: cols / rows < 0.3, i.e. 10 * cols < 3 * rows.
        if 10 * u32::from(cols) < 3 * u32::from(rows) {
            let allowed = (10 * u32::from(cols) / 3).min(u32::from(max_rows));
            rows = u16::try_from(allowed).unwrap_or(max_rows).max(MIN_ROWS);
        }
        (cols, rows)
    }
}

// Aspect ratio is reported ahead of per-axis bounds.
fn first_violation(proposed: &Dimensions) -> Option<RejectReason> {
    if proposed.cols == 0 {
        return Some(RejectReason::ColsOutOfRange { cols: 0 });
    }
    if proposed.rows == 0 {
        return Some(RejectReason::RowsOutOfRange { rows: 0 });
    }
    let ratio = proposed.aspect();
    if !(MIN_ASPECT..=MAX_ASPECT).contains(&ratio) {
        return Some(RejectReason::AspectRatio { ratio });
    }
    if !(MIN_COLS..=MAX_COLS).contains(&proposed.cols) {
        return Some(RejectReason::ColsOutOfRange {
            cols: proposed.cols,
        });
    }
    if !(MIN_ROWS..=MAX_ROWS).contains(&proposed.rows) {
        return Some(RejectReason::RowsOutOfRange {
            rows: proposed.rows,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(cols: u16, rows: u16) -> DimensionDecision {
        DimensionValidator::default().validate(&Dimensions::new(cols, rows))
    }

    #[test_timeout::timeout]
    fn standard_terminal_is_confirmed_unchanged() {
        let decision = validate(80, 24);
        assert_eq!(
            decision,
            DimensionDecision::Confirmed(ConfirmedDimensions {
                cols: 80,
                rows: 24,
                adjusted: false,
                reason: None,
            })
        );
    }

    #[test_timeout::timeout]
    fn implausible_aspect_is_rejected_with_suggestion() {
        let DimensionDecision::Rejected(rejection) = validate(10, 500) else {
            panic!("10x500 must be rejected");
        };
        assert!(matches!(rejection.reason, RejectReason::AspectRatio { .. }));
        let suggested = Dimensions::new(rejection.suggested_cols, rejection.suggested_rows);
        assert!(matches!(
            DimensionValidator::default().validate(&suggested),
            DimensionDecision::Confirmed(_)
        ));
    }

    #[test_timeout::timeout]
    fn out_of_range_axes_are_rejected() {
        let DimensionDecision::Rejected(narrow) = validate(12, 6) else {
            panic!("12 cols must be rejected");
        };
        assert_eq!(narrow.reason, RejectReason::ColsOutOfRange { cols: 12 });
        assert_eq!(narrow.suggested_cols, MIN_COLS);

        let DimensionDecision::Rejected(tall) = validate(320, 120) else {
            panic!("320x120 must be rejected");
        };
        assert!(matches!(tall.reason, RejectReason::ColsOutOfRange { .. }));
        assert_eq!((tall.suggested_cols, tall.suggested_rows), (300, 100));

        assert!(matches!(validate(0, 24), DimensionDecision::Rejected(_)));
        assert!(matches!(validate(80, 0), DimensionDecision::Rejected(_)));
    }

    #[test_timeout::timeout]
    fn device_limit_clamps_and_reports() {
        let validator = DimensionValidator::new(DimensionLimits::new(120, 40));
        let DimensionDecision::Confirmed(confirmed) = validator.validate(&Dimensions::new(200, 50))
        else {
            panic!("200x50 is within hard bounds");
        };
        assert_eq!((confirmed.cols, confirmed.rows), (120, 40));
        assert!(confirmed.adjusted);
        assert!(confirmed.reason.unwrap().contains("device maximum"));
    }

    #[test_timeout::timeout]
    fn short_device_trims_cols_to_keep_aspect() {
        let validator = DimensionValidator::new(DimensionLimits::new(300, 10));
        let DimensionDecision::Confirmed(confirmed) = validator.validate(&Dimensions::new(200, 30))
        else {
            panic!("200x30 is within hard bounds");
        };
        assert_eq!((confirmed.cols, confirmed.rows), (80, 10));
        assert!(confirmed.adjusted);

        let DimensionDecision::Rejected(rejection) = validator.validate(&Dimensions::new(300, 10))
        else {
            panic!("300x10 is too wide");
        };
        let suggested = Dimensions::new(rejection.suggested_cols, rejection.suggested_rows);
        assert_eq!(
            validator.validate(&suggested),
            DimensionDecision::Confirmed(ConfirmedDimensions {
                cols: 80,
                rows: 10,
                adjusted: false,
                reason: None,
            })
        );
    }

    #[test_timeout::timeout]
    fn every_outcome_satisfies_the_rules_it_enforces() {
        let limits = [
            DimensionLimits::default(),
            DimensionLimits::new(300, 10),
            DimensionLimits::new(20, 5),
            DimensionLimits::new(80, 100),
            DimensionLimits::new(120, 24),
        ];
        for limits in limits {
            let validator = DimensionValidator::new(limits);
            for cols in (0..=400u16).step_by(7) {
                for rows in (0..=150u16).step_by(3) {
                    match validator.validate(&Dimensions::new(cols, rows)) {
                        DimensionDecision::Confirmed(confirmed) => {
                            let fitted = Dimensions::new(confirmed.cols, confirmed.rows);
                            assert_eq!(first_violation(&fitted), None, "{cols}x{rows} under {limits:?}");
                            assert!(confirmed.cols <= limits.max_cols && confirmed.rows <= limits.max_rows);
                        }
                        DimensionDecision::Rejected(rejection) => {
                            let suggested =
                                Dimensions::new(rejection.suggested_cols, rejection.suggested_rows);
                            assert!(
                                matches!(
                                    validator.validate(&suggested),
                                    DimensionDecision::Confirmed(ConfirmedDimensions {
                                        adjusted: false,
                                        ..
                                    })
                                ),
                                "suggestion {suggested:?} for {cols}x{rows} under {limits:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
