pub mod scope_guard;
