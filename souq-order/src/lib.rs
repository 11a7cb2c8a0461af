pub mod adjudication;
pub mod checkout;
pub mod escrow;
pub mod lifecycle;
pub mod memory;
pub mod models;
pub mod payment;
pub mod repository;

pub use adjudication::{AdjudicationDecision, AdjudicationService};
pub use checkout::{CartLine, CheckoutRequest, CheckoutService, VendorShipping};
pub use escrow::SettlementService;
pub use memory::MemoryEngine;
pub use models::{DeliveryStatus, Escrow, Order, OrderLine, PaymentStatus, StatusEntry, SubOrder};
pub use repository::{OrderRepository, ReleaseFilter, ReleaseReceipt, SettlementRepository};
