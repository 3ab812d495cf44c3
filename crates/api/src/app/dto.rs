use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use loomerp_core::UserId;
use loomerp_infra::{EngineError, MaterializeOutcome, ShortageFulfillment};
use loomerp_inventory::StockEntry;
use loomerp_purchasing::PurchaseOrderStatus;
use loomerp_receiving::{LineCount, ShortageReceiptLine, VerificationStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct OpenReceiptRequest {
    pub remarks: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineCountRequest {
    pub material_name: String,
    pub invoiced_quantity: Decimal,
    pub received_quantity: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct RecordCountsRequest {
    pub items: Vec<LineCountRequest>,
}

impl RecordCountsRequest {
    pub fn into_counts(self) -> Vec<LineCount> {
        self.items
            .into_iter()
            .map(|l| LineCount {
                material_name: l.material_name,
                invoiced_quantity: l.invoiced_quantity,
                received_quantity: l.received_quantity,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyGrnRequest {
    pub verification_status: VerificationStatus,
    /// Defaults to the request actor.
    #[serde(default)]
    pub reviewer_id: Option<UserId>,
}

impl VerifyGrnRequest {
    /// The reviewer named in the body must agree with the `x-actor-id` header when both are sent.
    pub fn reviewer(&self, actor: Option<UserId>) -> Result<Option<UserId>, EngineError> {
        match (self.reviewer_id, actor) {
            (Some(reviewer), Some(actor)) if reviewer != actor => Err(EngineError::Validation {
                field: "reviewer_id".to_string(),
                message: format!("reviewer {reviewer} does not match the request actor {actor}"),
            }),
            (Some(reviewer), _) => Ok(Some(reviewer)),
            (None, actor) => Ok(actor),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShortageLineRequest {
    pub material_name: String,
    pub ordered_quantity: Decimal,
    pub invoiced_quantity: Decimal,
    pub received_quantity: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ShortageReceiptRequest {
    pub supplier_name: Option<String>,
    pub remarks: Option<String>,
    pub items: Vec<ShortageLineRequest>,
}

impl From<ShortageReceiptRequest> for ShortageFulfillment {
    fn from(req: ShortageReceiptRequest) -> Self {
        ShortageFulfillment {
            supplier_name: req.supplier_name,
            remarks: req.remarks,
            items: req
                .items
                .into_iter()
                .map(|l| ShortageReceiptLine {
                    material_name: l.material_name,
                    ordered_quantity: l.ordered_quantity,
                    invoiced_quantity: l.invoiced_quantity,
                    received_quantity: l.received_quantity,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: PurchaseOrderStatus,
}

#[derive(Debug, Serialize)]
pub struct MaterializeResponse {
    /// `true` when the GRN had already been materialized and nothing was written.
    pub replayed: bool,
    pub stock: Vec<StockEntry>,
}

impl From<MaterializeOutcome> for MaterializeResponse {
    fn from(outcome: MaterializeOutcome) -> Self {
        let replayed = outcome.is_replay();
        let stock = match outcome {
            MaterializeOutcome::Created(rows) | MaterializeOutcome::Replayed(rows) => rows,
        };
        Self { replayed, stock }
    }
}
