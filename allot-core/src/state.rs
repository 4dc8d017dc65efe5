use chrono::{DateTime, Utc};

use crate::error::IssuanceError;
use crate::types::{IssuanceRecord, IssuanceStatus};

/// Result of a successful status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: IssuanceStatus,
    pub to: IssuanceStatus,
    /// Units that must go back to the shared counter
    pub returned_quantity: i64,
}

/// Lifecycle rules for issuance records.
pub struct IssuanceStateMachine;

impl IssuanceStateMachine {
    /// Rows: current status. Cols: requested status. True = allowed.
    ///
    /// Order: Reserved(0), Confirmed(1), Used(2), Canceled(3), Failed(4)
    #[rustfmt::skip]
    const MATRIX: [[bool; 5]; 5] = [
        //          Res    Conf   Used   Canc   Fail
        /* Res  */ [false, true,  false, true,  true ],
        /* Conf */ [false, false, true,  true,  false],
        /* Used */ [false, false, false, true,  false],
        /* Canc */ [false, false, false, false, false],
        /* Fail */ [false, false, false, false, false],
    ];

    pub fn allows(from: IssuanceStatus, to: IssuanceStatus) -> bool {
        Self::MATRIX[from.to_index()][to.to_index()]
    }

    /// Moves `record` to `to`, stamping the matching timestamp.
    ///
    /// Leaving a quota-holding status for CANCELED or FAILED reports the
    /// record's quantity as returned; the caller owns giving it back.
    pub fn apply(
        record: &mut IssuanceRecord,
        to: IssuanceStatus,
        now: DateTime<Utc>,
        order_ref: Option<String>,
    ) -> Result<Transition, IssuanceError> {
        let from = record.status;
        if !Self::allows(from, to) {
            return Err(IssuanceError::InvalidTransition { from, to });
        }

        match to {
            IssuanceStatus::Confirmed => record.confirmed_at = Some(now),
            IssuanceStatus::Used => {
                record.used_at = Some(now);
                record.order_ref = order_ref;
            }
            IssuanceStatus::Canceled => {
                record.canceled_at = Some(now);
                record.order_ref = None;
            }
            IssuanceStatus::Reserved | IssuanceStatus::Failed => {}
        }
        record.status = to;
        record.updated_at = now;

        let returned_quantity = if from.holds_quota() && !to.holds_quota() {
            record.quantity
        } else {
            0
        };

        Ok(Transition {
            from,
            to,
            returned_quantity,
        })
    }
}
