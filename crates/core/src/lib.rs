pub mod api;
pub mod access;
pub mod credits;
pub mod error;
pub mod grpc;
pub mod principal;
pub mod tier;
pub mod user;
pub mod validation;
pub mod window;

pub use api::{Api, ApiType, CorsPolicy, Endpoint, GrpcPolicy, IpPolicy};
pub use access::{Group, Role, Routing, Subscription, RESERVED_GROUPS};
pub use credits::{CreditBalance, CreditDefinition, CreditTierSpec, UserCredits};
pub use error::{ErrorBody, ErrorCode};
pub use grpc::GrpcCode;
pub use principal::Principal;
pub use tier::{Tier, TierLimits, UserTierAssignment};
pub use user::{BandwidthQuota, RateQuota, ThrottleQuota, User};
pub use validation::{EndpointValidation, FieldType, ValidationRule};
pub use window::{RateWindow, bucket_index, bucket_start};
