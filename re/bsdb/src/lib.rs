//! On-disk bitstream database.
//!
//! Layout: `devices.json` at the root, per-device `tilegrid.json` and
//! `baseaddr.json` under `<family>/<device>/`, and per-scope solved tables
//! under `<family>/tiletypes/<tiletype>.json` and
//! `<family>/iptypes/<iptype>.json`.  Tables are lazily loaded and written
//! back atomically on `flush`.  All mutation of one scope is serialized by
//! that scope's lock, so independent fuzzing jobs may share one `Database`
//! handle across threads.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;
use prjdelta_types::bsdata::{
    ConfigBit, ConnectionData, EnumData, PipData, TileBitsTable, WordData,
};
use prjdelta_types::grid::{BaseAddrs, DeviceData, DevicesFile, TileGrid};
use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed database file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no device named {0} in the database")]
    UnknownDevice(String),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DbError> {
    let buf = fs::read_to_string(path).map_err(|source| DbError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&buf).map_err(|source| DbError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
struct ScopeData {
    scope: String,
    table: TileBitsTable,
    dirty: bool,
}

impl ScopeData {
    fn warn_setting_overlap(&self, name: &str, bits: impl Iterator<Item = ConfigBit>) {
        let mut others = BTreeSet::new();
        for (other, word) in &self.table.words {
            if other != name {
                others.extend(word.bits.iter().flatten().map(|cb| (cb.frame, cb.bit)));
            }
        }
        for (other, data) in &self.table.enums {
            if other != name {
                others.extend(data.options.values().flatten().map(|cb| (cb.frame, cb.bit)));
            }
        }
        for cb in bits {
            if others.contains(&(cb.frame, cb.bit)) {
                warn!(
                    "{scope}: bit {cb:?} of {name} is also claimed by another setting",
                    scope = self.scope
                );
            }
        }
    }

    fn add_pip(&mut self, from: &str, to: &str, bits: BTreeSet<ConfigBit>, full_mux: bool) {
        let mux = self.table.pips.entry(to.to_string()).or_default();
        if mux.full_mux != full_mux {
            if !mux.arcs.is_empty() {
                warn!(
                    "{scope}: mux shape of {to} changed (full_mux {old} -> {new})",
                    scope = self.scope,
                    old = mux.full_mux,
                    new = full_mux
                );
            }
            mux.full_mux = full_mux;
            self.dirty = true;
        }
        if let Some(arc) = mux.arcs.iter_mut().find(|a| a.from_wire == from) {
            if arc.bits != bits {
                warn!(
                    "{scope}: replacing {to}<-{from}: {old:?} -> {new:?}",
                    scope = self.scope,
                    old = arc.bits,
                    new = bits
                );
                arc.bits = bits;
                self.dirty = true;
            }
        } else {
            mux.arcs.push(PipData {
                from_wire: from.to_string(),
                bits,
            });
            self.dirty = true;
        }
    }

    fn add_word(&mut self, name: &str, desc: &str, bits: Vec<BTreeSet<ConfigBit>>) {
        self.warn_setting_overlap(name, bits.iter().flatten().copied());
        match self.table.words.get_mut(name) {
            None => {
                self.table.words.insert(
                    name.to_string(),
                    WordData {
                        bits,
                        desc: desc.to_string(),
                    },
                );
                self.dirty = true;
            }
            Some(word) => {
                if !desc.is_empty() && desc != word.desc {
                    word.desc = desc.to_string();
                    self.dirty = true;
                }
                if word.bits != bits {
                    warn!(
                        "{scope}: replacing word {name}: {old:?} -> {new:?}",
                        scope = self.scope,
                        old = word.bits,
                        new = bits
                    );
                    word.bits = bits;
                    self.dirty = true;
                }
            }
        }
    }

    fn add_enum_option(&mut self, name: &str, option: &str, desc: &str, bits: BTreeSet<ConfigBit>) {
        self.warn_setting_overlap(name, bits.iter().copied());
        let data = self.table.enums.entry(name.to_string()).or_insert(EnumData {
            options: Default::default(),
            desc: desc.to_string(),
        });
        if !desc.is_empty() && desc != data.desc {
            data.desc = desc.to_string();
            self.dirty = true;
        }
        match data.options.get_mut(option) {
            Some(old_bits) => {
                if *old_bits != bits {
                    warn!(
                        "{scope}: replacing enum {name}={option}: {old_bits:?} -> {bits:?}",
                        scope = self.scope
                    );
                    *old_bits = bits;
                    self.dirty = true;
                }
            }
            None => {
                data.options.insert(option.to_string(), bits);
                self.dirty = true;
            }
        }
    }

    fn add_conn(&mut self, from: &str, to: &str) {
        let conns = self.table.conns.entry(to.to_string()).or_default();
        if !conns.iter().any(|c| c.from_wire == from) {
            conns.push(ConnectionData {
                from_wire: from.to_string(),
            });
            self.dirty = true;
        }
    }

    fn set_always_on(&mut self, bits: &BTreeSet<ConfigBit>) {
        if *bits != self.table.always_on {
            self.table.always_on = bits.clone();
            self.dirty = true;
        }
    }
}

type ScopeMap = Mutex<HashMap<(String, String), Arc<Mutex<ScopeData>>>>;

#[derive(Debug)]
pub struct Database {
    root: PathBuf,
    devices: DevicesFile,
    tilegrids: Mutex<HashMap<(String, String), Arc<TileGrid>>>,
    baseaddrs: Mutex<HashMap<(String, String), Arc<BaseAddrs>>>,
    tilebits: ScopeMap,
    ipbits: ScopeMap,
}

impl Database {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DbError> {
        let root = root.into();
        let devices = read_json(&root.join("devices.json"))?;
        Ok(Self {
            root,
            devices,
            tilegrids: Default::default(),
            baseaddrs: Default::default(),
            tilebits: Default::default(),
            ipbits: Default::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.devices.families.keys().map(String::as_str)
    }

    pub fn devices(&self, family: &str) -> impl Iterator<Item = (&str, &DeviceData)> {
        self.devices
            .families
            .get(family)
            .into_iter()
            .flat_map(|f| f.devices.iter().map(|(k, v)| (k.as_str(), v)))
    }

    // Both lookups return a (family, device, data) triple.
    pub fn device_by_name(&self, name: &str) -> Option<(String, String, DeviceData)> {
        for (f, fd) in &self.devices.families {
            for (d, data) in &fd.devices {
                if d == name {
                    return Some((f.clone(), d.clone(), data.clone()));
                }
            }
        }
        None
    }

    pub fn device_by_idcode(&self, idcode: u32) -> Option<(String, String, DeviceData)> {
        for (f, fd) in &self.devices.families {
            for (d, data) in &fd.devices {
                if data.idcode == idcode {
                    return Some((f.clone(), d.clone(), data.clone()));
                }
            }
        }
        None
    }

    pub fn tilegrid(&self, family: &str, device: &str) -> Result<Arc<TileGrid>, DbError> {
        let key = (family.to_string(), device.to_string());
        let mut cache = self.tilegrids.lock().unwrap();
        if let Some(tg) = cache.get(&key) {
            return Ok(tg.clone());
        }
        let path = self.root.join(family).join(device).join("tilegrid.json");
        let tg = Arc::new(read_json::<TileGrid>(&path)?);
        cache.insert(key, tg.clone());
        Ok(tg)
    }

    pub fn baseaddr(&self, family: &str, device: &str) -> Result<Arc<BaseAddrs>, DbError> {
        let key = (family.to_string(), device.to_string());
        let mut cache = self.baseaddrs.lock().unwrap();
        if let Some(ba) = cache.get(&key) {
            return Ok(ba.clone());
        }
        let path = self.root.join(family).join(device).join("baseaddr.json");
        let ba = Arc::new(read_json::<BaseAddrs>(&path)?);
        cache.insert(key, ba.clone());
        Ok(ba)
    }

    fn scope_path(&self, kind: &str, family: &str, scope: &str) -> PathBuf {
        self.root.join(family).join(kind).join(format!("{scope}.json"))
    }

    fn load_scope(
        &self,
        cache: &ScopeMap,
        kind: &str,
        family: &str,
        scope: &str,
    ) -> Result<Arc<Mutex<ScopeData>>, DbError> {
        let key = (family.to_string(), scope.to_string());
        let mut cache = cache.lock().unwrap();
        if let Some(data) = cache.get(&key) {
            return Ok(data.clone());
        }
        let path = self.scope_path(kind, family, scope);
        let table = if path.exists() {
            read_json(&path)?
        } else {
            TileBitsTable::new()
        };
        let data = Arc::new(Mutex::new(ScopeData {
            scope: format!("{family}/{kind}/{scope}"),
            table,
            dirty: false,
        }));
        cache.insert(key, data.clone());
        Ok(data)
    }

    fn tile_scope(&self, family: &str, tiletype: &str) -> Result<Arc<Mutex<ScopeData>>, DbError> {
        self.load_scope(&self.tilebits, "tiletypes", family, tiletype)
    }

    fn ip_scope(&self, family: &str, iptype: &str) -> Result<Arc<Mutex<ScopeData>>, DbError> {
        self.load_scope(&self.ipbits, "iptypes", family, iptype)
    }

    /// Snapshot of the committed table for one tile type.
    pub fn tile_table(&self, family: &str, tiletype: &str) -> Result<TileBitsTable, DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        let data = scope.lock().unwrap();
        Ok(data.table.clone())
    }

    /// Snapshot of the committed table for one IP type.
    pub fn ip_table(&self, family: &str, iptype: &str) -> Result<TileBitsTable, DbError> {
        let scope = self.ip_scope(family, iptype)?;
        let data = scope.lock().unwrap();
        Ok(data.table.clone())
    }

    pub fn add_pip(
        &self,
        family: &str,
        tiletype: &str,
        from: &str,
        to: &str,
        bits: BTreeSet<ConfigBit>,
        full_mux: bool,
    ) -> Result<(), DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        scope.lock().unwrap().add_pip(from, to, bits, full_mux);
        Ok(())
    }

    pub fn add_word(
        &self,
        family: &str,
        tiletype: &str,
        name: &str,
        desc: &str,
        bits: Vec<BTreeSet<ConfigBit>>,
    ) -> Result<(), DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        scope.lock().unwrap().add_word(name, desc, bits);
        Ok(())
    }

    pub fn add_enum_option(
        &self,
        family: &str,
        tiletype: &str,
        name: &str,
        option: &str,
        desc: &str,
        bits: BTreeSet<ConfigBit>,
    ) -> Result<(), DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        scope.lock().unwrap().add_enum_option(name, option, desc, bits);
        Ok(())
    }

    pub fn add_conn(
        &self,
        family: &str,
        tiletype: &str,
        from: &str,
        to: &str,
    ) -> Result<(), DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        scope.lock().unwrap().add_conn(from, to);
        Ok(())
    }

    pub fn set_always_on(
        &self,
        family: &str,
        tiletype: &str,
        bits: &BTreeSet<ConfigBit>,
    ) -> Result<(), DbError> {
        let scope = self.tile_scope(family, tiletype)?;
        scope.lock().unwrap().set_always_on(bits);
        Ok(())
    }

    pub fn ip_add_word(
        &self,
        family: &str,
        iptype: &str,
        name: &str,
        desc: &str,
        bits: Vec<BTreeSet<ConfigBit>>,
    ) -> Result<(), DbError> {
        let scope = self.ip_scope(family, iptype)?;
        scope.lock().unwrap().add_word(name, desc, bits);
        Ok(())
    }

    pub fn ip_add_enum_option(
        &self,
        family: &str,
        iptype: &str,
        name: &str,
        option: &str,
        desc: &str,
        bits: BTreeSet<ConfigBit>,
    ) -> Result<(), DbError> {
        let scope = self.ip_scope(family, iptype)?;
        scope.lock().unwrap().add_enum_option(name, option, desc, bits);
        Ok(())
    }

    /// Copy solved records from one tile type to structurally identical
    /// ones.  `mode` selects record kinds by letter (P/E/W/C); `pattern`
    /// restricts to names containing it (empty matches everything).
    pub fn copy_tile_bits(
        &self,
        family: &str,
        from_tt: &str,
        to_tts: &[String],
        mode: &str,
        pattern: &str,
    ) -> Result<(), DbError> {
        let origin = self.tile_table(family, from_tt)?;
        for dest in to_tts {
            let scope = self.tile_scope(family, dest)?;
            let mut dest_data = scope.lock().unwrap();
            if mode.contains('P') {
                for (to_wire, mux) in &origin.pips {
                    for arc in &mux.arcs {
                        if pattern.is_empty()
                            || to_wire.contains(pattern)
                            || arc.from_wire.contains(pattern)
                        {
                            dest_data.add_pip(
                                &arc.from_wire,
                                to_wire,
                                arc.bits.clone(),
                                mux.full_mux,
                            );
                        }
                    }
                }
            }
            if mode.contains('E') {
                for (name, data) in &origin.enums {
                    if pattern.is_empty() || name.contains(pattern) {
                        for (option, bits) in &data.options {
                            dest_data.add_enum_option(name, option, &data.desc, bits.clone());
                        }
                    }
                }
            }
            if mode.contains('W') {
                for (name, data) in &origin.words {
                    if pattern.is_empty() || name.contains(pattern) {
                        dest_data.add_word(name, &data.desc, data.bits.clone());
                    }
                }
            }
            if mode.contains('C') {
                for (to_wire, conns) in &origin.conns {
                    for conn in conns {
                        if pattern.is_empty()
                            || to_wire.contains(pattern)
                            || conn.from_wire.contains(pattern)
                        {
                            dest_data.add_conn(&conn.from_wire, to_wire);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_scope(&self, path: &Path, table: &TileBitsTable) -> Result<(), DbError> {
        let parent = path.parent().unwrap();
        fs::create_dir_all(parent).map_err(|source| DbError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        let mut buf = serde_json::to_string_pretty(table).map_err(|source| DbError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        buf.push('\n');
        let mut tmp = NamedTempFile::new_in(parent).map_err(|source| DbError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        tmp.write_all(buf.as_bytes()).map_err(|source| DbError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tmp.persist(path).map_err(|e| DbError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Write every dirty scope back to disk, atomically per scope.
    pub fn flush(&self) -> Result<(), DbError> {
        let tilebits: Vec<_> = {
            let cache = self.tilebits.lock().unwrap();
            cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for ((family, tiletype), scope) in tilebits {
            let mut data = scope.lock().unwrap();
            if !data.dirty {
                continue;
            }
            self.write_scope(&self.scope_path("tiletypes", &family, &tiletype), &data.table)?;
            data.dirty = false;
        }
        let ipbits: Vec<_> = {
            let cache = self.ipbits.lock().unwrap();
            cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for ((family, iptype), scope) in ipbits {
            let mut data = scope.lock().unwrap();
            if !data.dirty {
                continue;
            }
            // IP scopes hold only word and enum records
            assert!(data.table.pips.is_empty());
            assert!(data.table.conns.is_empty());
            self.write_scope(&self.scope_path("iptypes", &family, &iptype), &data.table)?;
            data.dirty = false;
        }
        Ok(())
    }
}
