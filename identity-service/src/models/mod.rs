pub mod otp;
pub mod permission;
pub mod rate;
pub mod refresh_token;

pub use otp::{OtpPurpose, OtpRecord};
pub use permission::{
    PermissionCacheEntry, PermissionOverrides, PermissionSet, Principal, PrincipalKind, Role,
};
pub use rate::{RateAction, RateDecision};
pub use refresh_token::{RefreshToken, SessionInfo};
