//! YAML rendering of recorded frame layouts for shader dumps.
use std::fmt;

use raystack_ir::{shader::FrameEntry, FuncRef, Module, ShaderInfo};

/// The frame layout of one root shader, as recorded when
/// `emit_layout_entries` is set.
pub struct FrameLayoutReport<'a> {
    name: &'a str,
    info: &'a ShaderInfo,
}

impl<'a> FrameLayoutReport<'a> {
    /// Returns `None` if `root` carries no shader metadata.
    pub fn new(module: &'a Module, root: FuncRef) -> Option<Self> {
        let info = module.shader_info(root)?;
        Some(Self {
            name: module.func_name(root),
            info,
        })
    }

    pub fn entries(&self) -> &'a [FrameEntry] {
        &self.info.frame_entries
    }
}

impl fmt::Display for FrameLayoutReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shader: {}", Quoted(self.name))?;
        writeln!(f, "kind: {}", self.info.kind)?;
        writeln!(f, "stack_size: {}", self.info.stack_size)?;
        if self.entries().is_empty() {
            return writeln!(f, "entries: []");
        }

        writeln!(f, "entries:")?;
        for entry in self.entries() {
            writeln!(f, "  - kind: {}", entry.kind)?;
            writeln!(f, "    name: {}", Quoted(&entry.name))?;
            writeln!(f, "    offset: {}", entry.offset)?;
            writeln!(f, "    size: {}", entry.size)?;
            writeln!(f, "    type: {}", Quoted(&entry.ty))?;
        }
        Ok(())
    }
}

/// A double quoted YAML scalar.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                c => write!(f, "{c}")?,
            }
        }
        f.write_str("\"")
    }
}

#[cfg(test)]
mod tests {
    use raystack_ir::shader::FrameEntryKind;

    use super::*;
    use crate::test_util::*;

    fn entry(kind: FrameEntryKind, name: &str, offset: u64, size: u64, ty: &str) -> FrameEntry {
        FrameEntry {
            kind,
            name: name.to_string(),
            offset,
            size,
            ty: ty.to_string(),
        }
    }

    #[test]
    fn renders_recorded_entries() {
        let mut mb = test_module_builder();
        let root = declare_shader(&mut mb, "hit", ShaderKind::ClosestHit);
        let mut module = mb.build();
        let info = module.shader_info_mut(root).unwrap();
        info.stack_size = 32;
        info.frame_entries = vec![
            entry(FrameEntryKind::ReturnIp, "return_ip", 0, 8, "i64"),
            entry(FrameEntryKind::Argument, "payload", 8, 8, "ptr<global>"),
            entry(FrameEntryKind::Alloca, "color", 16, 12, "[f32; 3]"),
            entry(FrameEntryKind::SpillUnion, "hit.spills", 28, 4, "{f32}"),
        ];

        let report = FrameLayoutReport::new(&module, root).unwrap();
        insta::assert_snapshot!(report.to_string(), @r#"
        shader: "hit"
        kind: closesthit
        stack_size: 32
        entries:
          - kind: return_ip
            name: "return_ip"
            offset: 0
            size: 8
            type: "i64"
          - kind: argument
            name: "payload"
            offset: 8
            size: 8
            type: "ptr<global>"
          - kind: alloca
            name: "color"
            offset: 16
            size: 12
            type: "[f32; 3]"
          - kind: spill_union
            name: "hit.spills"
            offset: 28
            size: 4
            type: "{f32}"
        "#);
    }

    #[test]
    fn empty_layout() {
        let mut mb = test_module_builder();
        let root = declare_raygen(&mut mb, "main");
        let module = mb.build();

        let report = FrameLayoutReport::new(&module, root).unwrap();
        assert_eq!(
            report.to_string(),
            "shader: \"main\"\nkind: raygeneration\nstack_size: 0\nentries: []\n"
        );
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(Quoted("a\"b\\c").to_string(), r#""a\"b\\c""#);
    }
}
