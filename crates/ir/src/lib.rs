pub mod builder;
pub mod cfg;
pub mod dfg;
pub mod func_cursor;
pub mod function;
pub mod inst;
pub mod ir_writer;
pub mod layout;
pub mod module;
pub mod shader;
pub mod types;
pub mod value;

pub use cfg::ControlFlowGraph;
pub use dfg::{Block, BlockId, DataFlowGraph};
pub use function::{Function, Signature};
pub use inst::{InstData, InstId, RtInst};
pub use layout::Layout;
pub use module::{FuncRef, Module};
pub use shader::{ShaderInfo, ShaderKind};
pub use types::{AddrSpace, Type};
pub use value::{Immediate, Value, ValueId};
