//! Two-level dispatch table from (mode, PC) to generated code.
//!
//! Level one is indexed by the high PC bits, level two by the low bits;
//! unpopulated buckets share default tables whose every entry is the
//! "no-code" stub. Tables referenced by emitted code are allocated eagerly
//! and never move, so code-side walks and slot addresses baked into blocks
//! stay valid until the next reset.

use std::collections::HashMap;

type CodePtr = *const u8;

pub struct HashTable {
    modes: usize,
    l1bits: u32,
    l2bits: u32,
    l1shift: u32,
    l2shift: u32,
    l1mask: u32,
    l2mask: u32,
    nocode: CodePtr,

    /// Per-mode pointer to the first entry of its level-1 table.
    base: Box<[*mut *mut CodePtr]>,
    empty_l1: Box<[*mut CodePtr]>,
    empty_l2: Box<[CodePtr]>,

    l1_owned: Vec<Box<[*mut CodePtr]>>,
    l2_owned: Vec<Box<[CodePtr]>>,
    mode_l1: Vec<Option<usize>>,
    l2_index: HashMap<(usize, u32), usize>,
}

impl HashTable {
    pub fn new(modes: usize, addr_bits: u32, ignore_bits: u32) -> Self {
        assert!(modes >= 1);
        assert!(addr_bits > ignore_bits);
        let eff_bits = addr_bits - ignore_bits;
        let l2bits = eff_bits / 2;
        let l1bits = eff_bits - l2bits;
        let l2shift = ignore_bits;
        let l1shift = ignore_bits + l2bits;

        let empty_l2 = vec![std::ptr::null::<u8>() as CodePtr; 1 << l2bits].into_boxed_slice();
        let mut empty_l1 = vec![std::ptr::null_mut(); 1 << l1bits].into_boxed_slice();
        let l2_head = empty_l2.as_ptr() as *mut CodePtr;
        for entry in empty_l1.iter_mut() {
            *entry = l2_head;
        }
        let l1_head = empty_l1.as_ptr() as *mut *mut CodePtr;
        let base = vec![l1_head; modes].into_boxed_slice();

        HashTable {
            modes,
            l1bits,
            l2bits,
            l1shift,
            l2shift,
            l1mask: (1u32 << l1bits) - 1,
            l2mask: (1u32 << l2bits) - 1,
            nocode: std::ptr::null(),
            base,
            empty_l1,
            empty_l2,
            l1_owned: Vec::new(),
            l2_owned: Vec::new(),
            mode_l1: vec![None; modes],
            l2_index: HashMap::new(),
        }
    }

    /// Drop every registered target and point all default entries at the
    /// given no-code stub.
    pub fn reset(&mut self, nocode: CodePtr) {
        self.nocode = nocode;
        self.l1_owned.clear();
        self.l2_owned.clear();
        self.l2_index.clear();
        for slot in self.mode_l1.iter_mut() {
            *slot = None;
        }
        for entry in self.empty_l2.iter_mut() {
            *entry = nocode;
        }
        let l2_head = self.empty_l2.as_ptr() as *mut CodePtr;
        for entry in self.empty_l1.iter_mut() {
            *entry = l2_head;
        }
        let l1_head = self.empty_l1.as_ptr() as *mut *mut CodePtr;
        for entry in self.base.iter_mut() {
            *entry = l1_head;
        }
    }

    pub fn block_begin(&mut self) {}

    pub fn block_end(&mut self) {}

    fn ensure_l1(&mut self, mode: usize) -> usize {
        if let Some(index) = self.mode_l1[mode] {
            return index;
        }
        let l2_head = self.empty_l2.as_ptr() as *mut CodePtr;
        let table = vec![l2_head; 1 << self.l1bits].into_boxed_slice();
        let index = self.l1_owned.len();
        self.l1_owned.push(table);
        self.base[mode] = self.l1_owned[index].as_ptr() as *mut *mut CodePtr;
        self.mode_l1[mode] = Some(index);
        index
    }

    fn ensure_l2(&mut self, mode: usize, l1val: u32) -> usize {
        if let Some(&index) = self.l2_index.get(&(mode, l1val)) {
            return index;
        }
        let l1_index = self.ensure_l1(mode);
        let table = vec![self.nocode; 1 << self.l2bits].into_boxed_slice();
        let index = self.l2_owned.len();
        self.l2_owned.push(table);
        self.l1_owned[l1_index][l1val as usize] = self.l2_owned[index].as_ptr() as *mut CodePtr;
        self.l2_index.insert((mode, l1val), index);
        index
    }

    fn l1val(&self, pc: u32) -> u32 {
        (pc >> self.l1shift) & self.l1mask
    }

    fn l2val(&self, pc: u32) -> u32 {
        (pc >> self.l2shift) & self.l2mask
    }

    /// Register generated code for (mode, pc).
    pub fn set_codeptr(&mut self, mode: u32, pc: u32, code: CodePtr) {
        let mode = mode as usize;
        assert!(mode < self.modes, "mode {mode} out of range");
        let (l1, l2) = (self.l1val(pc), self.l2val(pc));
        let l2_index = self.ensure_l2(mode, l1);
        self.l2_owned[l2_index][l2 as usize] = code;
    }

    pub fn code_exists(&self, mode: u32, pc: u32) -> bool {
        let mode = mode as usize;
        if mode >= self.modes {
            return false;
        }
        match self.l2_index.get(&(mode, self.l1val(pc))) {
            Some(&index) => {
                let entry = self.l2_owned[index][self.l2val(pc) as usize];
                !entry.is_null() && entry != self.nocode
            }
            None => false,
        }
    }

    /// Whether the mode has any registered code (its level-1 table is
    /// private). Emitters use this to take address-of-table shortcuts that
    /// are only stable for private tables.
    pub fn is_mode_populated(&self, mode: u64) -> bool {
        (mode as usize) < self.modes && self.mode_l1[mode as usize].is_some()
    }

    // ── Addresses for emitted walks ─────────────────────────────────────

    /// Address of the per-mode base array.
    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Address (value) of the mode's level-1 table, made private so it can
    /// be baked into code.
    pub fn mode_l1_addr(&mut self, mode: u32) -> u64 {
        let mode = mode as usize;
        assert!(mode < self.modes);
        let index = self.ensure_l1(mode);
        self.l1_owned[index].as_ptr() as u64
    }

    /// Address of the code-pointer slot for (mode, pc), allocated eagerly so
    /// it can be baked into code.
    pub fn slot_addr(&mut self, mode: u32, pc: u32) -> u64 {
        let mode_index = mode as usize;
        assert!(mode_index < self.modes);
        let (l1, l2) = (self.l1val(pc), self.l2val(pc));
        let l2_index = self.ensure_l2(mode_index, l1);
        &self.l2_owned[l2_index][l2 as usize] as *const CodePtr as u64
    }

    pub fn l1shift(&self) -> u32 {
        self.l1shift
    }

    pub fn l1bits(&self) -> u32 {
        self.l1bits
    }

    pub fn l2shift(&self) -> u32 {
        self.l2shift
    }

    pub fn l2bits(&self) -> u32 {
        self.l2bits
    }

    pub fn l1mask(&self) -> u32 {
        self.l1mask
    }

    pub fn l2mask(&self) -> u32 {
        self.l2mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOCODE: CodePtr = 0x1000 as CodePtr;

    #[test]
    fn unregistered_lookups_reach_nocode() {
        let mut hash = HashTable::new(2, 32, 2);
        hash.reset(NOCODE);
        assert!(!hash.code_exists(0, 0x1234));
        assert!(!hash.is_mode_populated(0));

        // The slot the emitter would bake in holds nocode.
        let slot = hash.slot_addr(0, 0x1234) as *const CodePtr;
        assert_eq!(unsafe { *slot }, NOCODE);
    }

    #[test]
    fn registered_code_is_found_by_walks() {
        let mut hash = HashTable::new(1, 32, 2);
        hash.reset(NOCODE);
        let code = 0x4000 as CodePtr;
        hash.set_codeptr(0, 0x0010_2030, code);

        assert!(hash.code_exists(0, 0x0010_2030));
        assert!(!hash.code_exists(0, 0x0010_2034));
        assert!(hash.is_mode_populated(0));

        // Simulate the emitted three-level walk.
        let pc = 0x0010_2030u32;
        unsafe {
            let l1 = *(hash.base_addr() as *const *const *const CodePtr);
            let l2 = *l1.add(((pc >> hash.l1shift()) & hash.l1mask()) as usize);
            let entry = *l2.add(((pc >> hash.l2shift()) & hash.l2mask()) as usize);
            assert_eq!(entry, code);
        }
    }

    #[test]
    fn slot_addresses_are_stable_across_registration() {
        let mut hash = HashTable::new(1, 32, 2);
        hash.reset(NOCODE);
        let slot = hash.slot_addr(0, 0x80);
        hash.set_codeptr(0, 0x80, 0x7777 as CodePtr);
        assert_eq!(slot, hash.slot_addr(0, 0x80));
        assert_eq!(unsafe { *(slot as *const CodePtr) }, 0x7777 as CodePtr);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut hash = HashTable::new(1, 32, 2);
        hash.reset(NOCODE);
        hash.set_codeptr(0, 0x80, 0x7777 as CodePtr);
        hash.reset(NOCODE);
        assert!(!hash.code_exists(0, 0x80));
        assert!(!hash.is_mode_populated(0));
    }
}
