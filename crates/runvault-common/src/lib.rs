//! RunVault Common - Shared types and utilities
//!
//! This crate provides the document model, pipeline configuration and
//! error definitions used across all RunVault components.

pub mod config;
pub mod document;
pub mod error;

pub use config::PipelineConfig;
pub use document::{Doc, Document, DocumentKind, FieldRole, FieldRoles, StreamClass};
pub use error::{Error, Result};
