use crate::error::InfraError;
use crate::Result;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// 合并各主机的操作顺序，得到全局拓扑序
///
/// 每台主机的编译顺序是一条链；没有约束的操作按首次出现的顺序排列。
/// 链之间存在矛盾（有环）时返回 `OrderingError`
pub fn topological_order<'a, I>(chains: I, first_seen: &HashMap<String, usize>) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a Vec<String>>,
{
    let mut successors: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for chain in chains {
        for hash in chain {
            in_degree.entry(hash.as_str()).or_insert(0);
        }
        for pair in chain.windows(2) {
            let (before, after) = (pair[0].as_str(), pair[1].as_str());
            if before == after {
                continue;
            }
            if successors.entry(before).or_default().insert(after) {
                *in_degree.entry(after).or_insert(0) += 1;
            }
        }
    }

    let rank = |hash: &str| first_seen.get(hash).copied().unwrap_or(usize::MAX);
    let mut ready: BinaryHeap<Reverse<(usize, &str)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(hash, _)| Reverse((rank(*hash), *hash)))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse((_, hash))) = ready.pop() {
        order.push(hash.to_string());
        if let Some(next) = successors.get(hash) {
            for &successor in next {
                if let Some(degree) = in_degree.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((rank(successor), successor)));
                    }
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let placed: HashSet<&str> = order.iter().map(|h| h.as_str()).collect();
        let mut hashes: Vec<String> = in_degree
            .keys()
            .filter(|hash| !placed.contains(*hash))
            .map(|hash| hash.to_string())
            .collect();
        hashes.sort_by_key(|hash| (rank(hash.as_str()), hash.clone()));
        return Err(InfraError::OrderingError { hashes });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn seen(items: &[&str]) -> HashMap<String, usize> {
        items
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i))
            .collect()
    }

    #[test]
    fn test_merges_host_chains() {
        let chains = vec![chain(&["a", "b", "d"]), chain(&["a", "c", "d"])];
        let order = topological_order(&chains, &seen(&["a", "b", "c", "d"])).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_ties_break_by_first_seen() {
        let chains = vec![chain(&["x"]), chain(&["y"]), chain(&["w"])];
        let order = topological_order(&chains, &seen(&["y", "w", "x"])).unwrap();
        assert_eq!(order, vec!["y", "w", "x"]);
    }

    #[test]
    fn test_per_host_order_is_preserved() {
        // b 先出现，但 h2 要求 c 在 b 之前
        let chains = vec![chain(&["a", "b"]), chain(&["c", "b"])];
        let order = topological_order(&chains, &seen(&["a", "b", "c"])).unwrap();
        let pos = |h: &str| order.iter().position(|o| o == h).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("c") < pos("b"));
    }

    #[test]
    fn test_disagreement_is_an_ordering_error() {
        let chains = vec![chain(&["a", "b"]), chain(&["b", "a"])];
        match topological_order(&chains, &seen(&["a", "b"])) {
            Err(InfraError::OrderingError { hashes }) => assert_eq!(hashes, vec!["a", "b"]),
            other => panic!("expected OrderingError, got {:?}", other),
        }
    }
}
