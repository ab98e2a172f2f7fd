use log::warn;

use crate::cmd::{SdhcCmd, State};

const TAG: &'static str = "[SDHC_POOL]";

/// Fixed set of command descriptors, recycled between submission and completion.
pub(crate) struct CmdPool<const N: usize> {
    cmds: [SdhcCmd; N],
}

impl<const N: usize> CmdPool<N> {
    pub fn new() -> Self {
        assert!(N > 0 && N <= u8::MAX as usize);
        Self {
            cmds: core::array::from_fn(|_| SdhcCmd::default()),
        }
    }

    /// Hands out a free descriptor, reset to its defaults.
    pub fn acquire(&mut self) -> Option<u8> {
        let Some(slot) = self.cmds.iter().position(|cmd| !cmd.allocated) else {
            warn!("{TAG} all {N} command descriptors are in use");
            return None;
        };
        self.cmds[slot] = SdhcCmd {
            allocated: true,
            ..Default::default()
        };
        Some(slot as u8)
    }

    pub fn release(&mut self, slot: u8) {
        let cmd = &mut self.cmds[slot as usize];
        debug_assert!(cmd.allocated, "descriptor {slot} released twice");
        cmd.state = State::Done;
        cmd.data = None;
        cmd.next = None;
        cmd.allocated = false;
    }

    pub fn get(&self, slot: u8) -> &SdhcCmd {
        &self.cmds[slot as usize]
    }

    pub fn get_mut(&mut self, slot: u8) -> &mut SdhcCmd {
        &mut self.cmds[slot as usize]
    }

    pub fn in_use(&self) -> usize {
        self.cmds.iter().filter(|cmd| cmd.allocated).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SdhcCmd> {
        self.cmds.iter()
    }
}
