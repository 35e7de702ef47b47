//! Agent Sniper - Bonding-curve agent token lifecycle engine
//!
//! Tracks every agent token launched through the factory, classifies it as
//! a prototype (still on the bonding curve) or a sentient (graduated to an
//! external market), and trades prototypes: buy on launch, watch for the
//! profit target or stop-loss, then sell.
//!
//! # Modules
//!
//! - `domain`: Core types (AgentRecord, TradePosition, PositionBook, sizing)
//! - `ports`: Trait abstractions (ChainDataProvider, TradeExecutor, SnapshotStore)
//! - `adapters`: External implementations (retrying chain queries, JSON store, price oracle)
//! - `config`: Configuration loading, validation and logging setup
//! - `application`: Registry, subscriptions, dispatch, trade lifecycle and engine

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
