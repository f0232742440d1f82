use std::collections::HashMap;

use crate::description::StageSpec;
use crate::error::NetResult;
use crate::stage::kinds;
use crate::stage::Stage;
use crate::tensor::FloatElement;

/// Signature for stage builders: decode the stage's config block and return a fresh stage.
pub type BuildFn<T> = fn(&StageSpec) -> NetResult<Box<dyn Stage<T>>>;

#[derive(Clone, Copy)]
pub struct StageFactory<T: FloatElement> {
    pub kind: &'static str,
    pub build: BuildFn<T>,
    /// Loss kinds get a default weight of one on their first output.
    pub loss: bool,
}

/// Returns the list of built-in stage factories.
pub fn stage_factories<T: FloatElement>() -> &'static [StageFactory<T>] {
    &[
        StageFactory {
            kind: kinds::split::KIND,
            build: kinds::split::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::dummy_data::KIND,
            build: kinds::dummy_data::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::memory_data::KIND,
            build: kinds::memory_data::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::inner_product::KIND,
            build: kinds::inner_product::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::convolution::KIND,
            build: kinds::convolution::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::relu::KIND,
            build: kinds::relu::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::mvn::KIND,
            build: kinds::mvn::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::concat::KIND,
            build: kinds::concat::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::slice::KIND,
            build: kinds::slice::build::<T>,
            loss: false,
        },
        StageFactory {
            kind: kinds::euclidean_loss::KIND,
            build: kinds::euclidean_loss::build::<T>,
            loss: true,
        },
        StageFactory {
            kind: kinds::softmax_loss::KIND,
            build: kinds::softmax_loss::build::<T>,
            loss: true,
        },
    ]
}

/// Kind-to-factory lookup table. Starts from the built-in kinds; callers may register
/// their own stage implementations before building a graph.
pub struct StageRegistry<T: FloatElement> {
    factories: HashMap<String, StageFactory<T>>,
}

impl<T: FloatElement> StageRegistry<T> {
    pub fn empty() -> Self {
        StageRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = StageRegistry::empty();
        for entry in stage_factories::<T>() {
            registry.factories.insert(entry.kind.to_string(), *entry);
        }
        registry
    }

    /// Adds or replaces the factory for `kind`.
    pub fn register(&mut self, kind: &'static str, build: BuildFn<T>, loss: bool) {
        self.factories
            .insert(kind.to_string(), StageFactory { kind, build, loss });
    }

    pub fn get(&self, kind: &str) -> Option<&StageFactory<T>> {
        self.factories.get(kind)
    }

    pub fn is_loss_kind(&self, kind: &str) -> bool {
        self.get(kind).is_some_and(|f| f.loss)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl<T: FloatElement> Default for StageRegistry<T> {
    fn default() -> Self {
        StageRegistry::builtin()
    }
}
