//! 表格审计引擎
//!
//! 逻辑网格构建、缺陷检测、文档级审计协调以及修复结果回写。

pub mod coordinator;
pub mod detector;
pub mod grid;
pub mod markup;
pub mod reconstruct;
pub mod rules;

pub use coordinator::{repair_context, AuditCoordinator, AuditOutcome, TableAudit, AUDITABLE_FIELDS};
pub use detector::{analyze_table, Finding, TableAnalysis};
pub use grid::{build_grid, GridCell, GridError, TableGrid};
pub use reconstruct::{apply_repairs, ReconstructionSummary, SkippedRepair, TableRepair};
