/// Runs a closure when dropped, including on early return or task abort.
pub struct ScopeGuard<F: FnOnce()>(Option<F>);

pub fn defer<F: FnOnce()>(f: F) -> ScopeGuard<F> {
    ScopeGuard(Some(f))
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}
