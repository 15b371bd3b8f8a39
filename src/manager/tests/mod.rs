mod tests_manager;
