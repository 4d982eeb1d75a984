//! Rooted trees with branch lengths, arena-indexed, plus Newick IO.

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub name: Option<String>,
    pub length: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: usize,
}

impl Tree {
    pub fn parse_newick(input: &str) -> Result<Self> {
        let mut parser = NewickParser {
            input: input.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
        };
        parser.skip_ws();
        let root = parser.subtree(None)?;
        parser.skip_ws();
        if parser.peek() != Some(b';') {
            return Err(Error::Input("expected ';' at end of Newick string".into()));
        }
        Ok(Self {
            nodes: parser.nodes,
            root,
        })
    }

    pub fn to_newick(&self) -> String {
        let mut buf = String::new();
        self.write_subtree(self.root, &mut buf);
        buf.push(';');
        buf
    }

    fn write_subtree(&self, node: usize, buf: &mut String) {
        let n = &self.nodes[node];
        if !n.children.is_empty() {
            buf.push('(');
            for (i, &c) in n.children.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                self.write_subtree(c, buf);
            }
            buf.push(')');
        }
        if let Some(name) = &n.name {
            buf.push_str(name);
        }
        if let Some(len) = n.length {
            buf.push_str(&format!(":{}", len));
        }
    }

    pub fn nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].children.is_empty()
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.nodes[node].children
    }

    pub fn branch_length(&self, node: usize) -> f64 {
        self.nodes[node].length.unwrap_or(0.0)
    }

    pub fn node_name(&self, node: usize) -> Option<&str> {
        self.nodes[node].name.as_deref()
    }

    /// Display name: the node's own name, or a positional placeholder.
    pub fn seq_name(&self, node: usize) -> String {
        self.nodes[node]
            .name
            .clone()
            .unwrap_or_else(|| format!("node{}", node))
    }

    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&n| self.is_leaf(n)).collect()
    }

    /// Children-before-parent traversal order.
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
            } else {
                stack.push((node, true));
                for &c in self.nodes[node].children.iter().rev() {
                    stack.push((c, false));
                }
            }
        }
        order
    }

    /// Every internal node must have exactly two children.
    pub fn assert_binary(&self) -> Result<()> {
        for (i, n) in self.nodes.iter().enumerate() {
            if !n.children.is_empty() && n.children.len() != 2 {
                return Err(Error::Input(format!(
                    "node {} has {} children; the reconstruction needs a binary tree",
                    self.seq_name(i),
                    n.children.len()
                )));
            }
        }
        Ok(())
    }

    /// Branch lengths must be present, finite and non-negative everywhere
    /// below the root.
    pub fn validate_branch_lengths(&self) -> Result<()> {
        for (i, n) in self.nodes.iter().enumerate() {
            if i == self.root {
                continue;
            }
            match n.length {
                Some(l) if l.is_finite() && l >= 0.0 => {}
                Some(l) => {
                    return Err(Error::Input(format!(
                        "branch length {} at node {} is invalid",
                        l,
                        self.seq_name(i)
                    )))
                }
                None => {
                    return Err(Error::Input(format!(
                        "node {} has no branch length",
                        self.seq_name(i)
                    )))
                }
            }
        }
        Ok(())
    }
}

struct NewickParser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<TreeNode>,
}

impl<'a> NewickParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn subtree(&mut self, parent: Option<usize>) -> Result<usize> {
        self.skip_ws();
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            parent,
            children: Vec::new(),
            name: None,
            length: None,
        });
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.subtree(Some(id))?;
                self.nodes[id].children.push(child);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(Error::Input("expected ',' or ')' in Newick".into())),
                }
            }
        }
        self.label(id)?;
        Ok(id)
    }

    fn label(&mut self, id: usize) -> Result<()> {
        self.skip_ws();
        let name = self.take_while(|c| !b"(),:;".contains(&c) && !c.is_ascii_whitespace());
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_ws();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_ws();
            let num = self.take_while(|c| !b"(),:;".contains(&c) && !c.is_ascii_whitespace());
            let len: f64 = num
                .parse()
                .map_err(|_| Error::Input(format!("bad branch length {:?} in Newick", num)))?;
            self.nodes[id].length = Some(len);
        }
        Ok(())
    }

    fn take_while<F: Fn(u8) -> bool>(&mut self, f: F) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if f(c)) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cherry() {
        let t = Tree::parse_newick("(a:0.1,b:0.2)r;").unwrap();
        assert_eq!(t.nodes(), 3);
        assert_eq!(t.node_name(t.root()), Some("r"));
        let leaves = t.leaves();
        assert_eq!(leaves.len(), 2);
        assert!((t.branch_length(leaves[0]) - 0.1).abs() < 1e-12);
        t.assert_binary().unwrap();
        t.validate_branch_lengths().unwrap();
    }

    #[test]
    fn postorder_visits_children_first() {
        let t = Tree::parse_newick("((a:1,b:1):1,c:1);").unwrap();
        let order = t.postorder();
        assert_eq!(*order.last().unwrap(), t.root());
        let pos = |n: usize| order.iter().position(|&x| x == n).unwrap();
        for n in 0..t.nodes() {
            for &c in t.children(n) {
                assert!(pos(c) < pos(n));
            }
        }
    }

    #[test]
    fn round_trip() {
        let s = "((a:1,b:2):0.5,c:3)root;";
        let t = Tree::parse_newick(s).unwrap();
        assert_eq!(t.to_newick(), s);
    }

    #[test]
    fn rejects_nonbinary() {
        let t = Tree::parse_newick("(a:1,b:1,c:1);").unwrap();
        assert!(t.assert_binary().is_err());
        let t = Tree::parse_newick("(a:1,(b:1,c:1):1);").unwrap();
        assert!(t.assert_binary().is_ok());
    }

    #[test]
    fn missing_length_is_invalid() {
        let t = Tree::parse_newick("(a,b:1);").unwrap();
        assert!(t.validate_branch_lengths().is_err());
    }
}
