//! An in-memory file tree served over 9P.

use {
    async_trait::async_trait,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::{SystemTime, UNIX_EPOCH},
    },
    styx::{
        dm, errstr,
        srv::{Fid, Filesystem},
        Data, Error, FCall, QId, QIdType, Result, Stat,
    },
};

const ROOT_ID: u64 = 1;

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

struct Node {
    qid: QId,
    name: String,
    parent: u64,
    children: Vec<u64>,
    data: Vec<u8>,
    mode: u32,
    atime: u32,
    mtime: u32,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.qid.typ.contains(QIdType::DIR)
    }

    fn stat(&self) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.data.len() as u64,
            name: self.name.clone(),
            uid: "styx".to_owned(),
            gid: "styx".to_owned(),
            muid: "styx".to_owned(),
        }
    }
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next_id: u64,
}

impl Tree {
    fn new() -> Tree {
        let mut nodes = HashMap::new();
        let stamp = now();
        nodes.insert(
            ROOT_ID,
            Node {
                qid: QId {
                    typ: QIdType::DIR,
                    version: 0,
                    path: ROOT_ID,
                },
                name: "/".to_owned(),
                parent: ROOT_ID,
                children: Vec::new(),
                data: Vec::new(),
                mode: dm::DIR | 0o755,
                atime: stamp,
                mtime: stamp,
            },
        );
        Tree {
            nodes,
            next_id: ROOT_ID + 1,
        }
    }

    fn get(&self, id: u64) -> Result<&Node> {
        self.nodes.get(&id).ok_or_else(|| Error::msg(errstr::ENOFILE))
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::msg(errstr::ENOFILE))
    }

    fn child_by_name(&self, dir: u64, name: &str) -> Option<u64> {
        let dir = self.nodes.get(&dir)?;
        dir.children
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).map(|n| n.name == name).unwrap_or(false))
    }

    fn insert(&mut self, parent: u64, name: &str, perm: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let typ = if perm & dm::DIR != 0 {
            QIdType::DIR
        } else {
            QIdType::FILE
        };
        let stamp = now();
        self.nodes.insert(
            id,
            Node {
                qid: QId {
                    typ,
                    version: 0,
                    path: id,
                },
                name: name.to_owned(),
                parent,
                children: Vec::new(),
                data: Vec::new(),
                mode: perm,
                atime: stamp,
                mtime: stamp,
            },
        );
        if let Some(dir) = self.nodes.get_mut(&parent) {
            dir.children.push(id);
        }
        id
    }
}

/// A writable tree that lives for as long as the server process.
#[derive(Clone)]
pub struct MemFs {
    tree: Arc<Mutex<Tree>>,
}

impl MemFs {
    pub fn new() -> MemFs {
        MemFs {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }
}

#[async_trait]
impl Filesystem for MemFs {
    type Aux = Mutex<u64>;

    async fn rattach(
        &self,
        fid: &Fid<Self::Aux>,
        _afid: Option<&Fid<Self::Aux>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        *fid.aux.lock().unwrap() = ROOT_ID;
        let tree = self.tree.lock().unwrap();
        Ok(FCall::RAttach {
            qid: tree.get(ROOT_ID)?.qid,
        })
    }

    async fn rwalk(
        &self,
        fid: &Fid<Self::Aux>,
        newfid: &Fid<Self::Aux>,
        wnames: &[String],
    ) -> Result<FCall> {
        let tree = self.tree.lock().unwrap();
        let mut at = *fid.aux.lock().unwrap();
        let mut wqids = Vec::new();

        for name in wnames {
            let next = match name.as_str() {
                ".." => Some(tree.get(at)?.parent),
                "." => Some(at),
                name => tree.child_by_name(at, name),
            };
            match next {
                Some(id) => {
                    wqids.push(tree.get(id)?.qid);
                    at = id;
                }
                None => break,
            }
        }

        if wqids.len() == wnames.len() {
            *newfid.aux.lock().unwrap() = at;
        }
        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &Fid<Self::Aux>, mode: u8) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();
        let node = tree.get_mut(id)?;
        if mode & styx::om::TRUNC != 0 && !node.is_dir() {
            node.data.clear();
            node.mtime = now();
        }
        Ok(FCall::ROpen {
            qid: node.qid,
            iounit: 0,
        })
    }

    async fn rcreate(
        &self,
        fid: &Fid<Self::Aux>,
        name: &str,
        perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        let parent = *fid.aux.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();
        if tree.child_by_name(parent, name).is_some() {
            return Err(Error::msg("file already exists"));
        }
        let id = tree.insert(parent, name, perm);
        *fid.aux.lock().unwrap() = id;
        Ok(FCall::RCreate {
            qid: tree.get(id)?.qid,
            iounit: 0,
        })
    }

    async fn rread(&self, fid: &Fid<Self::Aux>, offset: u64, count: u32) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let tree = self.tree.lock().unwrap();
        let node = tree.get(id)?;
        if node.is_dir() {
            // directory contents are not enumerated over this server
            return Ok(FCall::RRead { data: Data(vec![]) });
        }
        let start = (offset as usize).min(node.data.len());
        let end = (start + count as usize).min(node.data.len());
        Ok(FCall::RRead {
            data: Data(node.data[start..end].to_vec()),
        })
    }

    async fn rwrite(&self, fid: &Fid<Self::Aux>, offset: u64, data: &Data) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();
        let node = tree.get_mut(id)?;
        if node.is_dir() {
            return Err(Error::msg(errstr::EISDIR));
        }
        let offset = offset as usize;
        if node.data.len() < offset + data.0.len() {
            node.data.resize(offset + data.0.len(), 0);
        }
        node.data[offset..offset + data.0.len()].copy_from_slice(&data.0);
        node.mtime = now();
        Ok(FCall::RWrite {
            count: data.0.len() as u32,
        })
    }

    async fn rremove(&self, fid: &Fid<Self::Aux>) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();
        if id == ROOT_ID {
            return Err(Error::msg("cannot remove the root"));
        }
        if !tree.get(id)?.children.is_empty() {
            return Err(Error::msg("directory not empty"));
        }
        let parent = tree.get(id)?.parent;
        tree.get_mut(parent)?.children.retain(|c| *c != id);
        tree.nodes.remove(&id);
        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &Fid<Self::Aux>) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let tree = self.tree.lock().unwrap();
        Ok(FCall::RStat {
            stat: tree.get(id)?.stat(),
        })
    }

    async fn rwstat(&self, fid: &Fid<Self::Aux>, stat: &Stat) -> Result<FCall> {
        let id = *fid.aux.lock().unwrap();
        let mut tree = self.tree.lock().unwrap();

        if !stat.name.is_empty() {
            let parent = tree.get(id)?.parent;
            if let Some(other) = tree.child_by_name(parent, &stat.name) {
                if other != id {
                    return Err(Error::msg("file already exists"));
                }
            }
            tree.get_mut(id)?.name = stat.name.clone();
        }
        if stat.length != !0 {
            let node = tree.get_mut(id)?;
            if node.is_dir() {
                return Err(Error::msg(errstr::EISDIR));
            }
            node.data.resize(stat.length as usize, 0);
        }
        if stat.mode != !0 {
            let node = tree.get_mut(id)?;
            node.mode = (node.mode & dm::DIR) | (stat.mode & !dm::DIR);
        }
        if stat.mtime != !0 {
            tree.get_mut(id)?.mtime = stat.mtime;
        }
        Ok(FCall::RWStat)
    }
}
