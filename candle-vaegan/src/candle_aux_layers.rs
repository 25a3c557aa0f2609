use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// One copy of a layer per dataset (session-specific input/output
/// layers); a single copy is shared by every dataset.
pub struct DatasetLayers<M>
where
    M: Module,
{
    layers: Vec<M>,
    activation: Option<Activation>,
}

impl<M> DatasetLayers<M>
where
    M: Module,
{
    /// * `layers` - one layer per dataset, or a single shared layer
    /// * `activation` - applied after whichever layer is selected
    pub fn new(layers: Vec<M>, activation: Option<Activation>) -> Self {
        Self { layers, activation }
    }

    pub fn num_datasets(&self) -> usize {
        self.layers.len()
    }

    /// Run the layer of `dataset` (defaults to the first one)
    pub fn forward_dataset(&self, x: &Tensor, dataset: Option<usize>) -> Result<Tensor> {
        let layer = match (self.layers.len(), dataset) {
            (1, _) | (_, None) => self.layers.first(),
            (_, Some(d)) => self.layers.get(d),
        };
        let Some(layer) = layer else {
            candle_core::bail!(
                "dataset {:?} out of range ({} dataset layers)",
                dataset,
                self.layers.len()
            );
        };
        let x = layer.forward(x)?;
        match &self.activation {
            Some(activation) => activation.forward(&x),
            None => Ok(x),
        }
    }
}
