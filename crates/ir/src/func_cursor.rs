use crate::{inst::InstData, BlockId, Function, InstId, Type, ValueId};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorLocation {
    At(InstId),
    BlockTop(BlockId),
    BlockBottom(BlockId),
    #[default]
    NoWhere,
}

/// A cursor to edit a function.
///
/// Inserting an instruction moves the cursor onto it, so consecutive
/// insertions keep their program order.
pub trait FuncCursor {
    fn at_location(loc: CursorLocation) -> Self;
    fn set_location(&mut self, loc: CursorLocation);
    fn loc(&self) -> CursorLocation;

    fn set_to_entry(&mut self, func: &Function) {
        let loc = if let Some(entry) = func.layout.entry_block() {
            CursorLocation::BlockTop(entry)
        } else {
            CursorLocation::NoWhere
        };

        self.set_location(loc);
    }

    /// Moves the cursor so that the next insertion lands right before `inst`.
    fn set_before(&mut self, func: &Function, inst: InstId) {
        let loc = match func.layout.prev_inst_of(inst) {
            Some(prev) => CursorLocation::At(prev),
            None => CursorLocation::BlockTop(func.layout.inst_block(inst)),
        };
        self.set_location(loc);
    }

    fn insert_inst(&mut self, func: &mut Function, inst: InstId) {
        match self.loc() {
            CursorLocation::At(at) => func.layout.insert_inst_after(inst, at),
            CursorLocation::BlockTop(block) => func.layout.prepend_inst(inst, block),
            CursorLocation::BlockBottom(block) => func.layout.append_inst(inst, block),
            CursorLocation::NoWhere => panic!("cursor loc points to `NoWhere`"),
        }
        self.set_location(CursorLocation::At(inst));
    }

    fn insert_inst_data(&mut self, func: &mut Function, data: InstData) -> InstId {
        let inst = func.dfg.make_inst(data);
        self.insert_inst(func, inst);
        inst
    }

    fn insert_inst_data_with_result(
        &mut self,
        func: &mut Function,
        data: InstData,
        ty: Type,
    ) -> ValueId {
        let inst = self.insert_inst_data(func, data);
        func.dfg.make_result(inst, ty)
    }

    fn replace(&mut self, func: &mut Function, data: InstData) {
        let inst = self.expect_inst();
        func.dfg.replace_inst(inst, data);
    }

    fn remove_inst(&mut self, func: &mut Function) {
        let inst = self.expect_inst();
        let next_loc = self.next_loc(func);

        func.dfg.untrack_inst(inst);
        func.layout.remove_inst(inst);

        self.set_location(next_loc);
    }

    fn make_block(&mut self, func: &mut Function) -> BlockId {
        func.dfg.make_block()
    }

    fn remove_block(&mut self, func: &mut Function) {
        let block = self.expect_block(func);

        // Store next block of the current block for later use.
        let next_block = func.layout.next_block_of(block);

        // Remove all insts in the current block.
        if let Some(first_inst) = func.layout.first_inst_of(block) {
            self.set_location(CursorLocation::At(first_inst));
            while matches!(self.loc(), CursorLocation::At(..)) {
                self.remove_inst(func);
            }
        }
        func.layout.remove_block(block);

        // Set cursor location to next block if exists.
        if let Some(next_block) = next_block {
            self.set_location(CursorLocation::BlockTop(next_block))
        } else {
            self.set_location(CursorLocation::NoWhere)
        }
    }

    fn inst(&self) -> Option<InstId> {
        if let CursorLocation::At(inst) = self.loc() {
            Some(inst)
        } else {
            None
        }
    }

    fn expect_inst(&self) -> InstId {
        match self.inst() {
            Some(inst) => inst,
            None => panic!("current cursor location doesn't point to inst"),
        }
    }

    fn block(&self, func: &Function) -> Option<BlockId> {
        match self.loc() {
            CursorLocation::At(inst) => Some(func.layout.inst_block(inst)),
            CursorLocation::BlockTop(block) | CursorLocation::BlockBottom(block) => Some(block),
            CursorLocation::NoWhere => None,
        }
    }

    fn expect_block(&self, func: &Function) -> BlockId {
        match self.block(func) {
            Some(block) => block,
            None => panic!("cursor loc points to `NoWhere`"),
        }
    }

    /// Inserts `block` after the current block, or appends it if the cursor
    /// points nowhere.
    fn insert_block(&mut self, func: &mut Function, block: BlockId) {
        if let Some(current) = self.block(func) {
            func.layout.insert_block_after(block, current)
        } else {
            func.layout.append_block(block)
        }
    }

    fn append_block(&mut self, func: &mut Function, block: BlockId) {
        func.layout.append_block(block);
    }

    fn next_loc(&self, func: &Function) -> CursorLocation {
        match self.loc() {
            CursorLocation::At(inst) => func.layout.next_inst_of(inst).map_or_else(
                || CursorLocation::BlockBottom(func.layout.inst_block(inst)),
                CursorLocation::At,
            ),
            CursorLocation::BlockTop(block) => func
                .layout
                .first_inst_of(block)
                .map_or(CursorLocation::BlockBottom(block), CursorLocation::At),
            CursorLocation::BlockBottom(block) => func
                .layout
                .next_block_of(block)
                .map_or(CursorLocation::NoWhere, CursorLocation::BlockTop),
            CursorLocation::NoWhere => CursorLocation::NoWhere,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InstInserter {
    loc: CursorLocation,
}

impl InstInserter {
    /// Cursor positioned so the next insertion lands right before `inst`.
    pub fn before(func: &Function, inst: InstId) -> Self {
        let mut inserter = Self::default();
        inserter.set_before(func, inst);
        inserter
    }
}

impl FuncCursor for InstInserter {
    fn at_location(loc: CursorLocation) -> Self {
        Self { loc }
    }

    fn set_location(&mut self, loc: CursorLocation) {
        self.loc = loc;
    }

    fn loc(&self) -> CursorLocation {
        self.loc
    }
}
