//! Ordering a set of simultaneous argument moves.
//!
//! An argument shuffle is a parallel assignment: every destination must receive the value its
//! source held *before* any move happened. Emitting the moves naively in order can clobber a
//! source before it is read. [schedule] turns the parallel assignment into an ordered sequence of
//! single moves that has the same effect.
//!
//! Each pending move is linked to the move that would kill its source (the move whose
//! destination is that source). A move nobody depends on is emitted first; emitting it may free
//! further moves. What remains when no move is free are cycles (every register is the
//! destination of at most one move, so a stuck register move's source chain always closes on
//! itself). A cycle is broken by saving one of its destinations to the scratch register of its
//! register class and redirecting the move that reads that destination to read the scratch
//! instead.
//!
//! Stack destinations are in the callee's outgoing area and stack sources in the caller's
//! incoming area, which never overlap, so moves to the stack depend on nothing the register moves
//! write and can all go first.

use drtmap::Location;
use std::{collections::HashSet, fmt};

/// One move of the scheduled sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Move {
    pub src: Location,
    pub dst: Location,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.dst, self.src)
    }
}

/// The registers a schedule may use to break cycles. Neither may appear as a source or
/// destination of any move.
#[derive(Clone, Copy, Debug)]
pub struct Scratch {
    pub gp: Location,
    pub fp: Location,
}

impl Scratch {
    fn for_class(&self, l: Location) -> Location {
        if l.is_fp() {
            self.fp
        } else {
            self.gp
        }
    }
}

/// Order the parallel assignment `moves` (as `(src, dst)` pairs) into a sequence of single
/// moves. A source may feed several destinations. Identity moves are dropped.
///
/// # Panics
///
/// If two moves write the same storage or if a scratch register is used by a move.
pub fn schedule(moves: &[(Location, Location)], scratch: Scratch) -> Vec<Move> {
    let mut dsts = HashSet::new();
    for &(src, dst) in moves {
        assert!(
            dsts.insert(dst.storage()),
            "two moves write {dst}"
        );
        for l in [src, dst] {
            assert!(
                l.storage() != scratch.gp.storage() && l.storage() != scratch.fp.storage(),
                "move {dst} <- {src} uses a scratch register"
            );
        }
    }

    let mut out = Vec::with_capacity(moves.len() + 1);
    let mut pending = Vec::new();
    for &(src, dst) in moves {
        if src == dst {
            continue;
        }
        if dst.is_stack() {
            out.push(Move { src, dst });
        } else {
            pending.push(Move { src, dst });
        }
    }

    while !pending.is_empty() {
        let free = pending.iter().position(|m| {
            !pending
                .iter()
                .any(|o| o.src.storage() == m.dst.storage())
        });
        match free {
            Some(i) => out.push(pending.remove(i)),
            None => {
                // Everything left is on a cycle. Save the first destination and redirect its
                // readers to the copy.
                let saved = pending[0].dst;
                let tmp = scratch.for_class(saved);
                out.push(Move { src: saved, dst: tmp });
                for m in pending.iter_mut() {
                    if m.src.storage() == saved.storage() {
                        m.src = tmp;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const SCRATCH: Scratch = Scratch {
        gp: Location::Gp { enc: 10, hi: false },
        fp: Location::Fp { enc: 15, hi: false },
    };

    fn gp(x: u8) -> Location {
        Location::gp(x)
    }

    fn show(ms: &[Move]) -> String {
        ms.iter().map(|m| m.to_string()).collect::<Vec<_>>().join("; ")
    }

    #[test]
    fn swap() {
        let ms = schedule(&[(gp(1), gp(2)), (gp(2), gp(1))], SCRATCH);
        assert_eq!(show(&ms), "r10 <- r2; r2 <- r1; r1 <- r10");
    }

    #[test]
    fn chain_needs_no_scratch() {
        let ms = schedule(&[(gp(1), gp(2)), (gp(2), gp(3)), (gp(3), gp(4))], SCRATCH);
        assert_eq!(show(&ms), "r4 <- r3; r3 <- r2; r2 <- r1");
    }

    #[test]
    fn stack_first_and_identity_dropped() {
        let ms = schedule(
            &[
                (gp(1), gp(2)),
                (gp(2), Location::stack(0)),
                (gp(3), gp(3)),
            ],
            SCRATCH,
        );
        assert_eq!(show(&ms), "[sp+0] <- r2; r2 <- r1");
    }

    #[test]
    fn fan_out() {
        let ms = schedule(&[(gp(1), gp(2)), (gp(1), gp(3)), (gp(2), gp(1))], SCRATCH);
        assert_eq!(show(&ms), "r3 <- r1; r10 <- r2; r2 <- r1; r1 <- r10");
    }

    #[test]
    fn two_cycles_two_classes() {
        let f = Location::fp;
        let ms = schedule(
            &[(gp(1), gp(2)), (gp(2), gp(1)), (f(1), f(2)), (f(2), f(1))],
            SCRATCH,
        );
        assert_eq!(
            show(&ms),
            "r10 <- r2; r2 <- r1; r1 <- r10; f15 <- f2; f2 <- f1; f1 <- f15"
        );
    }

    #[test]
    #[should_panic(expected = "two moves write")]
    fn duplicate_destination() {
        schedule(&[(gp(1), gp(2)), (gp(3), gp(2).next())], SCRATCH);
    }

    /// Run `moves` as a parallel assignment over `state`.
    fn parallel(
        moves: &[(Location, Location)],
        state: &HashMap<Location, u64>,
    ) -> HashMap<Location, u64> {
        let mut out = state.clone();
        for (src, dst) in moves {
            out.insert(*dst, state[src]);
        }
        out
    }

    fn sequential(moves: &[Move], state: &HashMap<Location, u64>) -> HashMap<Location, u64> {
        let mut out = state.clone();
        for m in moves {
            let v = out[&m.src];
            out.insert(m.dst, v);
        }
        out
    }

    fn any_loc() -> impl Strategy<Value = Location> {
        prop_oneof![
            (0u8..8).prop_map(Location::gp),
            (0u8..6).prop_map(Location::fp),
        ]
    }

    proptest! {
        #[test]
        fn matches_parallel_assignment(
            pairs in prop::collection::vec((any_loc(), any_loc()), 0..16),
            nstack in 0u32..4,
        ) {
            // Keep the first move to each destination and make sources the same class as their
            // destination, the way argument shuffles are.
            let mut seen = HashSet::new();
            let mut moves = Vec::new();
            for (src, dst) in pairs {
                if src.is_fp() == dst.is_fp() && seen.insert(dst) {
                    moves.push((src, dst));
                }
            }
            let mut regs = moves.iter().map(|(s, _)| *s).collect::<Vec<_>>();
            regs.sort();
            for (i, s) in regs.into_iter().take(nstack as usize).enumerate() {
                moves.push((s, Location::stack(i as u32 * 2)));
            }
            let mut state = HashMap::new();
            for (i, l) in (0u8..8).map(Location::gp).chain((0u8..6).map(Location::fp)).enumerate() {
                state.insert(l, i as u64 + 100);
            }
            for i in 0..4 {
                state.insert(Location::stack(i * 2), 0);
            }
            state.insert(SCRATCH.gp, 0);
            state.insert(SCRATCH.fp, 0);
            let mut want = parallel(&moves, &state);
            let mut got = sequential(&schedule(&moves, SCRATCH), &state);
            want.remove(&SCRATCH.gp);
            want.remove(&SCRATCH.fp);
            got.remove(&SCRATCH.gp);
            got.remove(&SCRATCH.fp);
            prop_assert_eq!(got, want);
        }
    }
}
