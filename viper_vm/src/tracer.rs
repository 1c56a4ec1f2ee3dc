//! Execution tracing (§4.H "Tracing"): off, IL-level, or source-level,
//! the latter resolving `SourceLoc` against a lazily-loaded
//! `viper_support::SourceManager`.

use viper_ir::{Function, Instruction};
use viper_support::SourceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Off,
    Il,
    Source,
}

pub struct Tracer {
    mode: TraceMode,
    sources: SourceManager,
}

impl Tracer {
    pub fn new(mode: TraceMode) -> Self {
        Tracer { mode, sources: SourceManager::new() }
    }

    pub fn off() -> Self {
        Self::new(TraceMode::Off)
    }

    pub fn register_file(&mut self, path: impl Into<String>) -> u32 {
        self.sources.add_file(path)
    }

    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    /// Writes one trace line to `sink` for the instruction about to run.
    /// A no-op in `Off` mode.
    pub fn trace(&mut self, sink: &mut dyn std::io::Write, func: &Function, block_index: usize, instr: &Instruction) {
        match self.mode {
            TraceMode::Off => {}
            TraceMode::Il => {
                let dest = instr.result.map(|(id, ty)| format!("%t{}:{} = ", id, ty)).unwrap_or_default();
                let _ = writeln!(sink, "{}#{}: {}{}", func.name, block_index, dest, instr);
            }
            TraceMode::Source => {
                let loc = instr.loc;
                if loc.is_known() {
                    let line_text = self.sources.line(loc.file, loc.line).unwrap_or("");
                    let _ = writeln!(sink, "{}:{}:{}: {}", func.name, loc.line, loc.column, line_text);
                } else {
                    let _ = writeln!(sink, "{}: (no source location): {}", func.name, instr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::{Instruction, Opcode, Type, Value};

    #[test]
    fn off_mode_writes_nothing() {
        let mut tracer = Tracer::off();
        let f = Function::new("f", Type::I64, vec![]);
        let instr = Instruction::binary(Opcode::Add, 0, Type::I64, Value::ConstInt(1, false), Value::ConstInt(2, false));
        let mut buf = Vec::new();
        tracer.trace(&mut buf, &f, 0, &instr);
        assert!(buf.is_empty());
    }

    #[test]
    fn il_mode_prints_opcode_and_destination() {
        let mut tracer = Tracer::new(TraceMode::Il);
        let f = Function::new("f", Type::I64, vec![]);
        let instr = Instruction::binary(Opcode::Add, 0, Type::I64, Value::ConstInt(1, false), Value::ConstInt(2, false));
        let mut buf = Vec::new();
        tracer.trace(&mut buf, &f, 0, &instr);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("%t0:i64 ="));
        assert!(text.contains("add"));
    }
}
