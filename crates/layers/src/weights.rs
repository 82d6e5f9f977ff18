//! Named, trainable kernel storage.
//!
//! [`WeightStore`] wraps a [`VarMap`] together with the device and dtype new
//! kernels are created on. Every kernel is registered once under a unique
//! name, which is what lets several layers share one store and lets the store
//! be saved and reloaded as safetensors.

use std::path::Path;

use candle_core::{DType, Device, Var};
use candle_nn::VarMap;

use crate::dtypes::PrecisionPolicy;
use crate::initializers::Initializer;
use crate::{checks, LayerError};

#[derive(Clone)]
pub struct WeightStore {
    varmap: VarMap,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for WeightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("WeightStore");
        out.field("device", &self.device.location())
            .field("dtype", &self.dtype);
        match self.names() {
            Ok(names) => out.field("names", &names),
            Err(err) => out.field("names", &err.to_string()),
        };
        out.finish()
    }
}

impl WeightStore {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
            dtype,
        }
    }

    /// Store of `f32` kernels on the CPU.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Precision policy matching the storage dtype of this store.
    pub fn policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(self.dtype)
    }

    /// Samples a `(rows, cols)` kernel with `initializer` and registers it as a
    /// trainable variable under `name`.
    pub fn add_weight(
        &self,
        name: &str,
        shape: (usize, usize),
        initializer: &dyn Initializer,
    ) -> Result<Var, LayerError> {
        let mut data = self.varmap.data().lock().map_err(|_| LayerError::Poisoned)?;
        if data.contains_key(name) {
            return Err(LayerError::DuplicateWeight {
                name: name.to_string(),
            });
        }

        let tensor = initializer.sample(shape, &self.device, self.dtype)?;
        checks::expect_shape(name, &tensor, &[shape.0, shape.1])?;
        let tensor = tensor.to_dtype(self.dtype)?.to_device(&self.device)?;
        let var = Var::from_tensor(&tensor)?;
        data.insert(name.to_string(), var.clone());
        log::debug!("weights: added {name} shape={shape:?} dtype={:?}", self.dtype);
        Ok(var)
    }

    /// Looks up a registered weight; fails only if the store lock is poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Var>, LayerError> {
        let data = self.varmap.data().lock().map_err(|_| LayerError::Poisoned)?;
        Ok(data.get(name).cloned())
    }

    pub fn contains(&self, name: &str) -> Result<bool, LayerError> {
        Ok(self.get(name)?.is_some())
    }

    /// Registered weight names in lexical order.
    pub fn names(&self) -> Result<Vec<String>, LayerError> {
        let data = self.varmap.data().lock().map_err(|_| LayerError::Poisoned)?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// All trainable variables, e.g. to hand to an optimizer.
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Writes every registered weight to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LayerError> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrites registered weights with the values stored in `path`.
    ///
    /// Weights must already exist (typically by building the same layers
    /// again); names missing from the file are reported as errors.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LayerError> {
        self.varmap.load(path)?;
        Ok(())
    }
}
