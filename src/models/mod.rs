mod address;
mod asset;
mod id;
mod money;
mod portfolio;

pub use address::{AddressEntry, AddressSource};
pub use asset::{
    format_amount, Asset, AssetBalance, AssetError, AssetMetadata, AssetType, PriceInfo,
    SourceKind,
};
pub use id::Id;
pub use money::{Money, MoneyError};
pub use portfolio::{AddOutcome, Portfolio, PortfolioSnapshot, TotalValue};
