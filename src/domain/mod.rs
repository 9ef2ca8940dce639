pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;
pub mod value_objects;

#[cfg(test)]
pub mod test_support;
#[cfg(test)]
mod order_lifecycle_tests;
#[cfg(test)]
mod concurrency_tests;
