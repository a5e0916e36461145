mod bindings;
mod capability;
mod common;
mod pool;
