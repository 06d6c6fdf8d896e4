//! 表格修复协议：结构分析、提示词、模型调用和输出校验

pub mod analysis;
pub mod prompts;
pub mod protocol;
pub mod validation;

pub use analysis::{analyze_structure, StructuralInstruction, StructureAnalysis};
pub use protocol::{AttemptRecord, RepairProtocol, RepairRequest, RepairResult, MAX_REPAIR_ATTEMPTS};
pub use validation::{extract_table, strip_code_fences, validate_output};
