//! Module enumeration and symbol reloads.

use tracing::{debug, warn};

use super::{decode_name, KernelSession, NAME_BUFFER_SIZE};
use crate::engine::DebugEngine;
use crate::error::{EngineResultExt, Result};
use crate::types::{Address, ModuleRecord};

impl<E: DebugEngine> KernelSession<E>
{
    /// Number of `(loaded, unloaded)` modules.
    pub fn get_number_modules(&self) -> Result<(u32, u32)>
    {
        self.engine.get_number_modules().op("get_number_modules")
    }

    /// Base address of the loaded module at `index`.
    pub fn get_module_by_index(&self, index: u32) -> Result<Address>
    {
        let raw = self
            .engine
            .get_module_by_index(index)
            .op("get_module_by_index")?;
        Ok(self.trim(raw))
    }

    /// `(image name, module name, loaded image name)` of the module at `index`.
    pub fn get_module_name_by_index(&self, index: u32) -> Result<(String, String, String)>
    {
        let record = self.module_record(index)?;
        Ok((record.image_name, record.module_name, record.loaded_image_name))
    }

    /// Reload every module's symbols, then describe each loaded module.
    pub fn get_modules(&mut self) -> Result<Vec<ModuleRecord>>
    {
        self.reload("")?;
        let (loaded, _) = self.get_number_modules()?;
        (0..loaded).map(|index| self.module_record(index)).collect()
    }

    /// Reload symbols of one module; an empty name reloads all of them.
    pub fn reload(&mut self, module: &str) -> Result<()>
    {
        debug!("Reloading symbols for {:?}", if module.is_empty() { "*" } else { module });
        self.engine.reload(module).op("reload")
    }

    /// Reload each loaded module by its module name.
    ///
    /// Done once after attaching, so that deferred symbol loads are resolved
    /// up front. A module that fails to reload is logged and skipped.
    pub fn load_module_symbols(&mut self) -> Result<usize>
    {
        let (loaded, _) = self.get_number_modules()?;
        let mut reloaded = 0;
        for index in 0..loaded {
            let record = self.module_record(index)?;
            match self.reload(&record.module_name) {
                Ok(()) => reloaded += 1,
                Err(e) => warn!("Failed to reload {}: {}", record.module_name, e),
            }
        }
        debug!("Reloaded symbols of {} of {} modules", reloaded, loaded);
        Ok(reloaded)
    }

    fn module_record(&self, index: u32) -> Result<ModuleRecord>
    {
        let base = self.get_module_by_index(index)?;
        let mut image = vec![0u8; NAME_BUFFER_SIZE];
        let mut module = vec![0u8; NAME_BUFFER_SIZE];
        let mut loaded_image = vec![0u8; NAME_BUFFER_SIZE];
        let sizes = self
            .engine
            .get_module_names(index, self.expand(base), &mut image, &mut module, &mut loaded_image)
            .op("get_module_names")?;
        Ok(ModuleRecord {
            index,
            base,
            module_name: decode_name("get_module_names", &module, sizes.module),
            image_name: decode_name("get_module_names", &image, sizes.image),
            loaded_image_name: decode_name("get_module_names", &loaded_image, sizes.loaded_image),
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::bitness::PointerWidth;
    use crate::config::SessionConfig;
    use crate::engine::FixtureEngine;

    fn session() -> KernelSession<FixtureEngine>
    {
        let engine = FixtureEngine::new_32bit()
            .with_module("nt", 0xffff_ffff_8280_4000, "ntkrpamp.exe")
            .with_module("hal", 0xffff_ffff_8284_0000, "halmacpi.dll");
        KernelSession::new(engine, PointerWidth::Bits32, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_module_queries()
    {
        let session = session();
        assert_eq!(session.get_number_modules().unwrap(), (2, 0));
        assert_eq!(session.get_module_by_index(1).unwrap(), Address::new(0x8284_0000));
        assert_eq!(
            session.get_module_name_by_index(0).unwrap(),
            ("ntkrpamp.exe".to_string(), "nt".to_string(), "ntkrpamp.exe".to_string())
        );
        assert!(session.get_module_by_index(5).is_err());
    }

    #[test]
    fn test_get_modules_reloads_first()
    {
        let mut session = session();
        let modules = session.get_modules().unwrap();
        assert_eq!(session.engine().reloads(), vec![String::new()]);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[1].module_name, "hal");
        assert_eq!(modules[1].base, Address::new(0x8284_0000));
    }

    #[test]
    fn test_load_module_symbols()
    {
        let mut session = session();
        assert_eq!(session.load_module_symbols().unwrap(), 2);
        assert_eq!(session.engine().reloads(), vec!["nt".to_string(), "hal".to_string()]);
    }
}
