use drtmap::Location;
use smallvec::SmallVec;

/// Where the registers of the frame being walked were saved by its callees.
///
/// Walking from a frame to its sender with an updating map records, from the frame's oop map, the
/// stack addresses of every register the frame saved. A register's value as the sender sees it is
/// then found at [Self::location].
#[derive(Clone, Debug)]
pub struct RegisterMap {
    locs: SmallVec<[(Location, u64); 16]>,
    update: bool,
}

impl RegisterMap {
    pub fn new(update: bool) -> Self {
        Self {
            locs: SmallVec::new(),
            update,
        }
    }

    /// Does walking with this map record saved register locations?
    pub fn update_map(&self) -> bool {
        self.update
    }

    pub fn set_location(&mut self, reg: Location, addr: u64) {
        debug_assert!(reg.is_reg());
        match self.locs.iter_mut().find(|(l, _)| *l == reg) {
            Some(e) => e.1 = addr,
            None => self.locs.push((reg, addr)),
        }
    }

    /// The address holding the value of `reg`, if some callee saved it.
    pub fn location(&self, reg: Location) -> Option<u64> {
        self.locs.iter().find(|(l, _)| *l == reg).map(|(_, a)| *a)
    }

    /// Forget every saved location, as when the walk crosses into an older entry frame.
    pub fn clear(&mut self) {
        self.locs.clear();
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Location, u64)> + '_ {
        self.locs.iter().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_and_clear() {
        let mut m = RegisterMap::new(true);
        m.set_location(Location::gp(3), 0x100);
        m.set_location(Location::gp(3), 0x108);
        m.set_location(Location::fp(1), 0x200);
        assert_eq!(m.location(Location::gp(3)), Some(0x108));
        assert_eq!(m.location(Location::gp(4)), None);
        assert_eq!(m.len(), 2);
        m.clear();
        assert!(m.is_empty());
    }
}
